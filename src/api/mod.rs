//! External collaborators: market analysis and order execution.
//!
//! Both are opaque to the core. Calls may fail; failures are handled per
//! symbol by the caller.

mod analyzer;
mod paper;
mod types;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::Signal;

pub use analyzer::ScriptedAnalyzer;
pub use paper::PaperExchange;
pub use types::{OrderReceipt, OrderRequest, OrderType};

/// Produces one signal per instrument per cycle.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyze(&self, symbol: &str) -> Result<Signal>;
}

/// Executes orders and reports the account balance.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn get_balance(&self) -> Result<Decimal>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt>;
}
