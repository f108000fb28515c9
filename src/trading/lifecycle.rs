//! Position lifecycle: per-cycle exit, resize and entry decisions.
//!
//! The manager owns the ledger of open positions and the closed history.
//! Each open position is evaluated once per cycle against rules applied in
//! strict priority order:
//! 1. stop loss
//! 2. take profit
//! 3. resize on a confident opposing signal
//!
//! A change to an open position goes through three steps. Under a short
//! write lock the position is re-read, the change decided and the id
//! claimed. The database is written with no lock held. The lock is then
//! re-taken to release the claim and, only if the write succeeded, apply
//! the change in memory. A claimed id is skipped by every other caller
//! until its change lands.

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{CloseReason, ClosedPosition, Position, Side, Signal};

use super::error::{CloseError, ValidationError};
use super::history::{HistoryStats, HistoryStore};
use super::ledger::PositionLedger;
use super::risk_engine::{validate_signal, RiskEngine, SizingDecision};
use super::RiskConfig;

/// What the rules decide for one position, before anything is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Close(CloseReason),
    Resize,
    Hold,
}

/// Why a position was left as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// No rule matched
    NoTrigger,
    /// Resize computed the size the position already has
    ResizeUnchanged,
    /// Resize computed a zero size; positions never shrink to nothing
    ResizeYieldedZero,
}

/// Outcome of evaluating one open position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PositionAction {
    Closed {
        id: String,
        reason: CloseReason,
        exit_price: Decimal,
        pnl: Decimal,
    },
    Resized {
        id: String,
        old_size: Decimal,
        new_size: Decimal,
    },
    Held {
        id: String,
        reason: HoldReason,
    },
    Failed {
        id: String,
        error: String,
    },
}

impl PositionAction {
    fn failed(id: &str, error: impl ToString) -> Self {
        PositionAction::Failed {
            id: id.to_string(),
            error: error.to_string(),
        }
    }
}

/// Why no new position should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The symbol already has an open position
    PositionOpen,
    /// Confidence did not exceed the entry threshold
    LowConfidence,
    /// Committed margin leaves no balance to size against
    InsufficientBalance,
    /// Sizing produced zero for another reason
    ZeroSize,
}

/// Result of evaluating a symbol for a new position.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Opportunity {
    Trade(SizingDecision),
    Skip { reason: SkipReason },
}

/// Apply the lifecycle rules to one position. First match wins.
///
/// Fails only when the P&L at the signal price leaves the decimal range.
pub fn evaluate(
    position: &Position,
    signal: &Signal,
    resize_confidence_threshold: Decimal,
) -> Result<Decision, ValidationError> {
    let pnl = position
        .pnl_at(signal.current_price)
        .ok_or(ValidationError::Overflow { field: "pnl" })?;

    if pnl <= -position.stop_loss_pct {
        return Ok(Decision::Close(CloseReason::StopLoss));
    }

    if pnl >= position.take_profit_pct {
        return Ok(Decision::Close(CloseReason::TakeProfit));
    }

    if signal.opposes(position.side) && signal.confidence > resize_confidence_threshold {
        return Ok(Decision::Resize);
    }

    Ok(Decision::Hold)
}

struct Book {
    ledger: PositionLedger,
    history: HistoryStore,
    /// Ids with a database write in flight
    claimed: HashSet<String>,
}

/// A change decided under the lock, waiting to be persisted.
enum Change {
    Close(ClosedPosition),
    Resize { old_size: Decimal, updated: Position },
}

enum Step {
    Done(PositionAction),
    Commit(Change),
}

/// Owns open positions and closed history; the only writer to either.
pub struct PositionLifecycleManager {
    engine: RiskEngine,
    book: RwLock<Book>,
    store: Option<Database>,
}

impl PositionLifecycleManager {
    /// In-memory manager with no persistence.
    pub fn new(config: RiskConfig) -> Self {
        let window = config.performance_window;
        Self {
            engine: RiskEngine::new(config),
            book: RwLock::new(Book {
                ledger: PositionLedger::new(),
                history: HistoryStore::new(window),
                claimed: HashSet::new(),
            }),
            store: None,
        }
    }

    /// Manager backed by `db`, restoring open positions and history from it.
    pub async fn restore(config: RiskConfig, db: Database) -> anyhow::Result<Self> {
        let open = db.load_open_positions().await?;
        let closed = db.load_history().await?;
        let window = config.performance_window;

        let mut manager = Self::new(config);
        let book = manager.book.get_mut();
        for position in open {
            book.ledger.insert(position);
        }
        book.history = HistoryStore::from_records(window, closed);

        info!(
            open_positions = book.ledger.len(),
            closed_positions = book.history.len(),
            "Restored position state"
        );

        manager.store = Some(db);
        Ok(manager)
    }

    pub fn config(&self) -> &RiskConfig {
        self.engine.config()
    }

    /// Open positions for `symbol`, oldest first.
    pub async fn get_open_positions(&self, symbol: &str) -> Vec<Position> {
        self.book.read().await.ledger.get(symbol).to_vec()
    }

    /// All open positions across symbols.
    pub async fn all_open_positions(&self) -> Vec<Position> {
        self.book.read().await.ledger.all()
    }

    pub async fn history_stats(&self) -> HistoryStats {
        self.book.read().await.history.stats()
    }

    /// Closed positions, oldest first.
    pub async fn history(&self) -> Vec<ClosedPosition> {
        self.book.read().await.history.records().to_vec()
    }

    /// Decide whether to open a position on `symbol` and how large.
    ///
    /// Only symbols without an open position and with confidence above the
    /// entry threshold are sized. Committed margin across the whole account
    /// is deducted from `balance`.
    pub async fn evaluate_opportunity(
        &self,
        symbol: &str,
        balance: Decimal,
        signal: &Signal,
    ) -> Result<Opportunity, ValidationError> {
        self.engine.validate(balance, signal)?;

        let book = self.book.read().await;

        if !book.ledger.get(symbol).is_empty() {
            return Ok(Opportunity::Skip {
                reason: SkipReason::PositionOpen,
            });
        }

        if signal.confidence <= self.config().entry_confidence_threshold {
            debug!(
                symbol = %symbol,
                confidence = %signal.confidence,
                threshold = %self.config().entry_confidence_threshold,
                "Confidence below entry threshold"
            );
            return Ok(Opportunity::Skip {
                reason: SkipReason::LowConfidence,
            });
        }

        let open = book.ledger.all();
        let stats = book.history.stats();
        let decision = self.engine.compute_size(balance, signal, &open, &stats)?;

        if decision.size <= Decimal::ZERO {
            let reason = if decision.insufficient_balance() {
                SkipReason::InsufficientBalance
            } else {
                SkipReason::ZeroSize
            };
            return Ok(Opportunity::Skip { reason });
        }

        info!(
            symbol = %symbol,
            size = %decision.size,
            risk_pct = %decision.params.risk_percentage,
            kelly = %decision.params.kelly_fraction,
            "Sized new opportunity"
        );

        Ok(Opportunity::Trade(decision))
    }

    /// Record a newly filled position in the database, then the ledger.
    pub async fn open_position(
        &self,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        size: Decimal,
        leverage: u32,
    ) -> anyhow::Result<Position> {
        if entry_price <= Decimal::ZERO {
            return Err(ValidationError::NonPositive {
                field: "entry_price",
                value: entry_price,
            }
            .into());
        }
        if size <= Decimal::ZERO {
            return Err(ValidationError::NonPositive {
                field: "size",
                value: size,
            }
            .into());
        }

        let config = self.config();
        let position = Position::open(
            symbol.to_string(),
            side,
            entry_price,
            size,
            leverage,
            config.stop_loss_pct,
            config.take_profit_pct,
        );

        if let Some(db) = &self.store {
            db.insert_position(&position).await?;
        }
        self.book.write().await.ledger.insert(position.clone());

        info!(
            id = %position.id,
            symbol = %symbol,
            side = %side,
            entry = %entry_price,
            size = %size,
            leverage = leverage,
            "Opened position"
        );

        Ok(position)
    }

    /// Evaluate every open position on `symbol` against `signal`.
    ///
    /// Returns one action per position, in ledger order. A failure on one
    /// position is reported as `Failed` and does not stop the others. A
    /// position that another call is closing or resizing is skipped and
    /// gets no action.
    pub async fn manage_positions(
        &self,
        symbol: &str,
        signal: &Signal,
    ) -> Result<Vec<PositionAction>, ValidationError> {
        validate_signal(signal)?;

        let ids: Vec<String> = self
            .book
            .read()
            .await
            .ledger
            .get(symbol)
            .iter()
            .map(|position| position.id.clone())
            .collect();
        let mut actions = Vec::with_capacity(ids.len());

        for id in ids {
            let step = {
                let mut book = self.book.write().await;
                let Some(position) = book.ledger.find(&id).cloned() else {
                    debug!(id = %id, "Position closed elsewhere, skipping");
                    continue;
                };
                if book.claimed.contains(&id) {
                    debug!(id = %id, "Position has a change in flight, skipping");
                    continue;
                }

                let step = self.plan(&book, &position, signal);
                if matches!(step, Step::Commit(_)) {
                    book.claimed.insert(id.clone());
                }
                step
            };

            let action = match step {
                Step::Done(action) => action,
                Step::Commit(change) => self.commit(change).await,
            };

            debug!(symbol = %symbol, action = ?action, "Position evaluated");
            actions.push(action);
        }

        Ok(actions)
    }

    /// Close an open position by hand at `exit_price`.
    pub async fn close_position(
        &self,
        id: &str,
        exit_price: Decimal,
    ) -> Result<ClosedPosition, CloseError> {
        if exit_price <= Decimal::ZERO {
            return Err(ValidationError::NonPositive {
                field: "exit_price",
                value: exit_price,
            }
            .into());
        }

        let record = {
            let mut book = self.book.write().await;
            if book.claimed.contains(id) {
                return Err(CloseError::InFlight(id.to_string()));
            }
            let record = book
                .ledger
                .find(id)
                .ok_or_else(|| CloseError::NotOpen(id.to_string()))?
                .close(exit_price, CloseReason::Manual, Utc::now())
                .ok_or(ValidationError::Overflow { field: "pnl" })?;
            book.claimed.insert(id.to_string());
            record
        };

        self.commit_close(record).await
    }

    /// Decide what happens to `position`. Runs under the write lock.
    fn plan(&self, book: &Book, position: &Position, signal: &Signal) -> Step {
        let threshold = self.config().resize_confidence_threshold;
        let decision = match evaluate(position, signal, threshold) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(id = %position.id, error = %e, "Evaluation rejected");
                return Step::Done(PositionAction::failed(&position.id, e));
            }
        };

        match decision {
            Decision::Close(reason) => {
                match position.close(signal.current_price, reason, Utc::now()) {
                    Some(record) => Step::Commit(Change::Close(record)),
                    None => Step::Done(PositionAction::failed(
                        &position.id,
                        ValidationError::Overflow { field: "pnl" },
                    )),
                }
            }
            Decision::Resize => self.plan_resize(book, position, signal),
            Decision::Hold => Step::Done(PositionAction::Held {
                id: position.id.clone(),
                reason: HoldReason::NoTrigger,
            }),
        }
    }

    /// Resize against the position's own size as the capital base.
    fn plan_resize(&self, book: &Book, position: &Position, signal: &Signal) -> Step {
        let open = book.ledger.all();
        let stats = book.history.stats();

        let decision = match self
            .engine
            .compute_size(position.size, signal, &open, &stats)
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(id = %position.id, error = %e, "Resize rejected");
                return Step::Done(PositionAction::failed(&position.id, e));
            }
        };

        if decision.size.is_zero() {
            return Step::Done(PositionAction::Held {
                id: position.id.clone(),
                reason: HoldReason::ResizeYieldedZero,
            });
        }

        if decision.size == position.size {
            return Step::Done(PositionAction::Held {
                id: position.id.clone(),
                reason: HoldReason::ResizeUnchanged,
            });
        }

        Step::Commit(Change::Resize {
            old_size: position.size,
            updated: position.resized(decision.size),
        })
    }

    async fn commit(&self, change: Change) -> PositionAction {
        match change {
            Change::Close(record) => {
                let id = record.id.clone();
                let reason = record.reason;
                match self.commit_close(record).await {
                    Ok(record) => PositionAction::Closed {
                        id: record.id,
                        reason,
                        exit_price: record.exit_price,
                        pnl: record.pnl,
                    },
                    Err(e) => {
                        warn!(id = %id, error = %e, "Failed to close position");
                        PositionAction::failed(&id, e)
                    }
                }
            }
            Change::Resize { old_size, updated } => {
                let id = updated.id.clone();
                let new_size = updated.size;
                match self.commit_resize(updated).await {
                    Ok(()) => {
                        info!(
                            id = %id,
                            old_size = %old_size,
                            new_size = %new_size,
                            "Resized position"
                        );
                        PositionAction::Resized {
                            id,
                            old_size,
                            new_size,
                        }
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "Failed to persist resize");
                        PositionAction::failed(&id, e)
                    }
                }
            }
        }
    }

    /// Move a claimed position from the ledger to the history.
    ///
    /// The database transaction commits first; memory is only touched once
    /// it has succeeded, so a failure leaves the position open everywhere.
    async fn commit_close(&self, record: ClosedPosition) -> Result<ClosedPosition, CloseError> {
        let persisted = match &self.store {
            Some(db) => db
                .record_close(&record)
                .await
                .map_err(|source| CloseError::Persistence {
                    id: record.id.clone(),
                    source,
                }),
            None => Ok(()),
        };

        let mut book = self.book.write().await;
        book.claimed.remove(&record.id);
        persisted?;
        book.ledger.remove(&record.id);
        book.history.append(record.clone());
        drop(book);

        info!(
            id = %record.id,
            symbol = %record.symbol,
            reason = %record.reason,
            exit = %record.exit_price,
            pnl = %record.pnl,
            "Closed position"
        );

        Ok(record)
    }

    /// Persist a claimed resize, then swap it into the ledger.
    async fn commit_resize(&self, updated: Position) -> anyhow::Result<()> {
        let persisted = match &self.store {
            Some(db) => db.update_position_size(&updated).await,
            None => Ok(()),
        };

        let mut book = self.book.write().await;
        book.claimed.remove(&updated.id);
        persisted?;
        let id = updated.id.clone();
        book.ledger.replace(&id, updated);
        Ok(())
    }
}
