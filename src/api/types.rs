//! Order types exchanged with the exchange gateway.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Side;

/// How an order is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderType {
    /// Fill at the prevailing market price
    Market,
    /// Fill at `price` or better
    Limit { price: Decimal },
}

impl OrderType {
    /// Limit at the suggested entry when there is one, market otherwise.
    pub fn for_entry(suggested_entry: Option<Decimal>) -> Self {
        match suggested_entry {
            Some(price) => OrderType::Limit { price },
            None => OrderType::Market,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit { .. } => "limit",
        }
    }
}

/// Request to open a leveraged position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub size: Decimal,
    pub order_type: OrderType,
}

/// Exchange acknowledgement of a filled order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub leverage: u32,
    pub size: Decimal,
    pub fill_price: Decimal,
    pub placed_at: DateTime<Utc>,
}
