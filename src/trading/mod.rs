//! Trading logic: risk sizing, open-position ledger, closed history and the
//! lifecycle manager that ties them together.

mod config;
mod error;
mod history;
mod ledger;
mod lifecycle;
mod risk_engine;

pub use config::RiskConfig;
#[cfg(test)]
pub use lifecycle::HoldReason;
pub use lifecycle::{Opportunity, PositionAction, PositionLifecycleManager, SkipReason};
