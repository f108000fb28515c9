//! Simulated exchange for paper trading.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::info;

use super::types::{OrderReceipt, OrderRequest, OrderType};
use super::ExchangeGateway;

/// In-memory gateway. Balance stays fixed; orders fill immediately at the
/// limit price, or at the last mark price for market orders.
pub struct PaperExchange {
    balance: Decimal,
    mark_prices: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<Vec<OrderReceipt>>,
}

impl PaperExchange {
    pub fn new(balance: Decimal) -> Self {
        Self {
            balance,
            mark_prices: RwLock::new(HashMap::new()),
            orders: RwLock::new(Vec::new()),
        }
    }

    /// Update the price market orders on `symbol` fill at.
    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.mark_prices
            .write()
            .await
            .insert(symbol.to_string(), price);
    }

    /// Every order filled so far.
    #[cfg(test)]
    pub async fn orders(&self) -> Vec<OrderReceipt> {
        self.orders.read().await.clone()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn get_balance(&self) -> Result<Decimal> {
        Ok(self.balance)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderReceipt> {
        if order.size <= Decimal::ZERO {
            anyhow::bail!("Order size must be positive, got {}", order.size);
        }

        let fill_price = match order.order_type {
            OrderType::Limit { price } => price,
            OrderType::Market => self
                .mark_prices
                .read()
                .await
                .get(&order.symbol)
                .copied()
                .with_context(|| format!("No market price for {}", order.symbol))?,
        };

        let receipt = OrderReceipt {
            order_id: uuid::Uuid::new_v4().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            leverage: order.leverage,
            size: order.size,
            fill_price,
            placed_at: Utc::now(),
        };

        info!(
            order_id = %receipt.order_id,
            symbol = %receipt.symbol,
            side = %receipt.side,
            order_type = order.order_type.as_str(),
            size = %receipt.size,
            price = %fill_price,
            "[PAPER] Order filled"
        );

        self.orders.write().await.push(receipt.clone());
        Ok(receipt)
    }
}
