//! Bot runner: the per-cycle loop around the lifecycle manager.
//!
//! Each cycle:
//! - Fetches the account balance (with retry) and records it
//! - Fans out over the configured symbols concurrently
//! - Per symbol: analyze, manage open positions, then size and place a new
//!   entry when there is an opportunity
//!
//! A failure on one symbol becomes that symbol's `SymbolOutcome::Failed`;
//! the others carry on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backoff::ExponentialBackoffBuilder;
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::{AnalysisProvider, ExchangeGateway, OrderRequest, OrderType};
use crate::db::Database;
use crate::models::Position;
use crate::trading::{Opportunity, PositionAction, PositionLifecycleManager, SkipReason};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Instruments evaluated every cycle
    pub symbols: Vec<String>,

    /// Seconds between cycles
    pub poll_interval_secs: u64,

    /// Stop after this many cycles; run until ctrl-c when `None`
    pub max_cycles: Option<u64>,

    /// Give up on the balance fetch after retrying this long (seconds)
    pub balance_retry_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            poll_interval_secs: 60,
            max_cycles: None,
            balance_retry_secs: 30,
        }
    }
}

/// What happened to one symbol during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SymbolOutcome {
    /// A new position was opened
    Traded {
        symbol: String,
        actions: Vec<PositionAction>,
        order_id: String,
        position: Position,
    },
    /// Open positions were managed but nothing new was opened
    NoTrade {
        symbol: String,
        actions: Vec<PositionAction>,
        reason: SkipReason,
    },
    /// An external call or validation failed; `actions` holds whatever was
    /// already applied before the failure
    Failed {
        symbol: String,
        actions: Vec<PositionAction>,
        error: String,
    },
}

impl SymbolOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SymbolOutcome::Failed { .. })
    }
}

/// Result of one full cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub balance: Decimal,
    pub outcomes: Vec<SymbolOutcome>,
}

impl CycleReport {
    pub fn traded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SymbolOutcome::Traded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    manager: Arc<PositionLifecycleManager>,
    analyzer: Arc<dyn AnalysisProvider>,
    exchange: Arc<dyn ExchangeGateway>,
    db: Option<Database>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Repeated symbols are dropped, keeping the first occurrence, so a
    /// symbol is never processed twice in one cycle.
    pub fn new(
        mut config: BotConfig,
        manager: Arc<PositionLifecycleManager>,
        analyzer: Arc<dyn AnalysisProvider>,
        exchange: Arc<dyn ExchangeGateway>,
    ) -> Self {
        let mut seen = HashSet::new();
        config.symbols.retain(|symbol| seen.insert(symbol.clone()));

        Self {
            config,
            manager,
            analyzer,
            exchange,
            db: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record the balance curve in `db` each cycle.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    #[cfg(test)]
    pub fn manager(&self) -> &PositionLifecycleManager {
        &self.manager
    }

    /// Main run loop.
    pub async fn run(&self) -> Result<()> {
        info!(
            symbols = ?self.config.symbols,
            poll_interval = self.config.poll_interval_secs,
            max_cycles = ?self.config.max_cycles,
            "Starting bot run loop"
        );

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut cycle = 0u64;
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.config.max_cycles.is_some_and(|max| cycle >= max) {
                break;
            }

            poll_interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            cycle += 1;

            match self.run_cycle(cycle).await {
                Ok(report) => info!(
                    cycle = cycle,
                    balance = %report.balance,
                    traded = report.traded(),
                    failed = report.failed(),
                    "Cycle complete"
                ),
                Err(e) => error!(cycle = cycle, error = %e, "Cycle skipped"),
            }
        }

        info!(cycles = cycle, "Bot stopped");
        Ok(())
    }

    /// Run a single cycle across all symbols.
    ///
    /// Fails only when the balance cannot be fetched; per-symbol failures
    /// are reported in the returned outcomes.
    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport> {
        debug!(cycle = cycle, "Bot cycle");

        let balance = self.fetch_balance().await?;
        self.record_balance(balance).await;

        let outcomes = join_all(
            self.config
                .symbols
                .iter()
                .map(|symbol| self.process_symbol(symbol, balance)),
        )
        .await;

        Ok(CycleReport {
            cycle,
            balance,
            outcomes,
        })
    }

    /// Fetch the balance, retrying transient failures with exponential backoff.
    async fn fetch_balance(&self) -> Result<Decimal> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_elapsed_time(Some(Duration::from_secs(self.config.balance_retry_secs)))
            .build();

        let exchange = self.exchange.clone();
        backoff::future::retry(policy, || {
            let exchange = exchange.clone();
            async move {
                exchange.get_balance().await.map_err(|e| {
                    warn!(error = %e, "Balance fetch failed");
                    backoff::Error::transient(e)
                })
            }
        })
        .await
    }

    async fn record_balance(&self, balance: Decimal) {
        let Some(db) = &self.db else {
            return;
        };

        let open = self.manager.all_open_positions().await;
        let committed: Decimal = open.iter().map(|p| p.margin).sum();

        if let Err(e) = db
            .record_balance_point(
                balance.to_f64().unwrap_or(0.0),
                committed.to_f64().unwrap_or(0.0),
                open.len() as i64,
            )
            .await
        {
            warn!(error = %e, "Failed to record balance point");
        }
    }

    /// Analyze, manage and possibly enter one symbol.
    async fn process_symbol(&self, symbol: &str, balance: Decimal) -> SymbolOutcome {
        let failed = |actions: Vec<PositionAction>, error: String| {
            warn!(symbol = %symbol, error = %error, "Symbol failed this cycle");
            SymbolOutcome::Failed {
                symbol: symbol.to_string(),
                actions,
                error,
            }
        };

        let signal = match self.analyzer.analyze(symbol).await {
            Ok(signal) => signal,
            Err(e) => return failed(Vec::new(), format!("analysis failed: {:#}", e)),
        };

        let actions = match self.manager.manage_positions(symbol, &signal).await {
            Ok(actions) => actions,
            Err(e) => return failed(Vec::new(), e.to_string()),
        };

        let decision = match self
            .manager
            .evaluate_opportunity(symbol, balance, &signal)
            .await
        {
            Ok(Opportunity::Trade(decision)) => decision,
            Ok(Opportunity::Skip { reason }) => {
                debug!(symbol = %symbol, reason = ?reason, "No new position");
                return SymbolOutcome::NoTrade {
                    symbol: symbol.to_string(),
                    actions,
                    reason,
                };
            }
            Err(e) => return failed(actions, e.to_string()),
        };

        let order = OrderRequest {
            symbol: symbol.to_string(),
            side: signal.direction,
            leverage: signal.suggested_leverage,
            size: decision.size,
            order_type: OrderType::for_entry(signal.suggested_entry),
        };

        let receipt = match self.exchange.place_order(&order).await {
            Ok(receipt) => receipt,
            Err(e) => return failed(actions, format!("order failed: {:#}", e)),
        };

        match self
            .manager
            .open_position(
                symbol,
                receipt.side,
                receipt.fill_price,
                receipt.size,
                receipt.leverage,
            )
            .await
        {
            Ok(position) => SymbolOutcome::Traded {
                symbol: symbol.to_string(),
                actions,
                order_id: receipt.order_id,
                position,
            },
            Err(e) => {
                error!(
                    symbol = %symbol,
                    order_id = %receipt.order_id,
                    error = %e,
                    "Order filled but position was not recorded"
                );
                failed(actions, format!("{:#}", e))
            }
        }
    }

    pub async fn get_stats(&self) -> BotStats {
        BotStats::collect(&self.manager, self.db.as_ref()).await
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub open_positions: usize,
    pub committed_margin: Decimal,
    pub closed_positions: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub realized_pnl: Decimal,
    /// Fraction of peak balance, 0.0 - 1.0
    pub max_drawdown: f64,
}

impl BotStats {
    pub async fn collect(manager: &PositionLifecycleManager, db: Option<&Database>) -> Self {
        let open = manager.all_open_positions().await;
        let stats = manager.history_stats().await;
        let max_drawdown = match db {
            Some(db) => db.calculate_max_drawdown().await.unwrap_or(0.0),
            None => 0.0,
        };

        Self {
            open_positions: open.len(),
            committed_margin: open.iter().map(|p| p.margin).sum(),
            closed_positions: stats.total_closed,
            win_count: stats.win_count,
            loss_count: stats.loss_count,
            realized_pnl: stats.sum_win_pnl + stats.sum_loss_pnl,
            max_drawdown,
        }
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Open Positions:   {}", self.open_positions)?;
        writeln!(f, "Committed Margin: {:.2}", self.committed_margin)?;
        writeln!(f, "Closed Positions: {} (Wins: {}, Losses: {})",
            self.closed_positions, self.win_count, self.loss_count)?;
        writeln!(f, "Realized P&L:     {:.2}", self.realized_pnl)?;
        writeln!(f, "Max Drawdown:     {:.2}%", self.max_drawdown * 100.0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderReceipt, PaperExchange, ScriptedAnalyzer};
    use crate::models::{Side, Signal};
    use crate::trading::{HoldReason, RiskConfig};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn xbt_signal() -> Signal {
        Signal {
            direction: Side::Long,
            confidence: dec!(0.9),
            current_price: dec!(64000),
            suggested_entry: Some(dec!(63900)),
            suggested_leverage: 3,
            market_volatility: dec!(10),
        }
    }

    fn make_bot(symbols: &[&str], exchange: Arc<dyn ExchangeGateway>) -> Bot {
        let mut signals = HashMap::new();
        signals.insert("XBTUSDTM".to_string(), xbt_signal());

        let config = BotConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            poll_interval_secs: 1,
            max_cycles: Some(1),
            balance_retry_secs: 0,
        };

        Bot::new(
            config,
            Arc::new(PositionLifecycleManager::new(RiskConfig::default())),
            Arc::new(ScriptedAnalyzer::new(signals)),
            exchange,
        )
    }

    struct DownExchange;

    #[async_trait]
    impl ExchangeGateway for DownExchange {
        async fn get_balance(&self) -> Result<Decimal> {
            anyhow::bail!("exchange unavailable")
        }

        async fn place_order(&self, _order: &OrderRequest) -> Result<OrderReceipt> {
            anyhow::bail!("exchange unavailable")
        }
    }

    #[tokio::test]
    async fn test_failed_symbol_does_not_abort_others() {
        let bot = make_bot(
            &["SOLUSDTM", "XBTUSDTM"],
            Arc::new(PaperExchange::new(dec!(10000))),
        );

        let report = bot.run_cycle(1).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.traded(), 1);

        assert!(matches!(
            &report.outcomes[0],
            SymbolOutcome::Failed { symbol, .. } if symbol == "SOLUSDTM"
        ));

        match &report.outcomes[1] {
            SymbolOutcome::Traded { position, .. } => {
                assert_eq!(position.size, dec!(81));
                assert_eq!(position.entry_price, dec!(63900));
                assert_eq!(position.leverage, 3);
                assert_eq!(position.side, Side::Long);
            }
            other => panic!("expected a trade, got {:?}", other),
        }

        assert_eq!(bot.manager().get_open_positions("XBTUSDTM").await.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_symbol_processed_once() {
        let bot = make_bot(
            &["XBTUSDTM", "XBTUSDTM"],
            Arc::new(PaperExchange::new(dec!(10000))),
        );

        let report = bot.run_cycle(1).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.traded(), 1);
        assert_eq!(bot.manager().get_open_positions("XBTUSDTM").await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_cycle_holds_open_position() {
        let bot = make_bot(&["XBTUSDTM"], Arc::new(PaperExchange::new(dec!(10000))));

        bot.run_cycle(1).await.unwrap();
        let report = bot.run_cycle(2).await.unwrap();

        match &report.outcomes[0] {
            SymbolOutcome::NoTrade { actions, reason, .. } => {
                assert_eq!(*reason, SkipReason::PositionOpen);
                assert_eq!(actions.len(), 1);
                assert!(matches!(
                    actions[0],
                    PositionAction::Held {
                        reason: HoldReason::NoTrigger,
                        ..
                    }
                ));
            }
            other => panic!("expected no trade, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_order_failure_opens_nothing() {
        struct RejectingExchange;

        #[async_trait]
        impl ExchangeGateway for RejectingExchange {
            async fn get_balance(&self) -> Result<Decimal> {
                Ok(dec!(10000))
            }

            async fn place_order(&self, _order: &OrderRequest) -> Result<OrderReceipt> {
                anyhow::bail!("rejected")
            }
        }

        let bot = make_bot(&["XBTUSDTM"], Arc::new(RejectingExchange));
        let report = bot.run_cycle(1).await.unwrap();

        assert!(report.outcomes[0].is_failed());
        assert!(bot.manager().all_open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_balance_failure_skips_cycle() {
        let bot = make_bot(&["XBTUSDTM"], Arc::new(DownExchange));
        assert!(bot.run_cycle(1).await.is_err());
        assert!(bot.manager().all_open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_after_max_cycles() {
        let db = Database::in_memory().await.unwrap();
        let bot = make_bot(&["XBTUSDTM"], Arc::new(PaperExchange::new(dec!(10000))))
            .with_database(db.clone());

        bot.run().await.unwrap();

        assert_eq!(db.get_balance_curve(10).await.unwrap().len(), 1);
        let stats = bot.get_stats().await;
        assert_eq!(stats.open_positions, 1);
        assert_eq!(stats.committed_margin, dec!(27));
    }
}
