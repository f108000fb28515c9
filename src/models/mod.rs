//! Data models for signals, open positions, and closed position history.

mod position;
mod signal;

pub use position::{CloseReason, ClosedPosition, Position};
pub use signal::{Side, Signal};
