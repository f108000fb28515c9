//! Risk-adjusted position sizing: dynamic risk percentage times a capped
//! Kelly fraction of the balance not already committed as margin.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::debug;

use crate::models::{Position, Signal};

use super::error::ValidationError;
use super::history::HistoryStats;
use super::RiskConfig;

/// Hard floor on the risk percentage.
pub const MIN_RISK_PCT: Decimal = dec!(0.5);
/// Hard ceiling on the risk percentage.
pub const MAX_RISK_PCT: Decimal = dec!(5.0);
/// Kelly fraction cap, also the fallback when there is no usable history.
pub const MAX_KELLY: Decimal = dec!(0.5);
pub const DEFAULT_KELLY: Decimal = dec!(0.5);

const MIN_PERFORMANCE_FACTOR: Decimal = dec!(0.5);
const MAX_PERFORMANCE_FACTOR: Decimal = dec!(1.5);

/// Intermediate values behind a sizing decision, kept for audit logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskParams {
    pub available_balance: Decimal,
    pub volatility_factor: Decimal,
    pub confidence_factor: Decimal,
    pub performance_factor: Decimal,
    pub risk_percentage: Decimal,
    pub kelly_fraction: Decimal,
}

/// Output of `RiskEngine::compute_size`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingDecision {
    /// Position size in account currency, never negative
    pub size: Decimal,
    pub params: RiskParams,
}

impl SizingDecision {
    /// True when there was no free balance left to size against.
    pub fn insufficient_balance(&self) -> bool {
        self.params.available_balance <= Decimal::ZERO
    }
}

/// Stateless sizing calculator.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    config: RiskConfig,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Calculate the size of a position.
    ///
    /// # Arguments
    /// * `balance` - Account balance (or, when resizing, the position's own size)
    /// * `signal` - Current analysis for the instrument
    /// * `open_positions` - Positions whose margin is already committed
    /// * `stats` - Running aggregate over closed positions
    ///
    /// Returns a zero size, not an error, when the committed margin uses up
    /// the whole balance.
    pub fn compute_size(
        &self,
        balance: Decimal,
        signal: &Signal,
        open_positions: &[Position],
        stats: &HistoryStats,
    ) -> Result<SizingDecision, ValidationError> {
        self.validate(balance, signal)?;

        let committed = open_positions
            .iter()
            .try_fold(Decimal::ZERO, |acc, p| acc.checked_add(p.margin))
            .ok_or(ValidationError::Overflow { field: "committed_margin" })?;
        let available_balance = balance
            .checked_sub(committed)
            .ok_or(ValidationError::Overflow { field: "available_balance" })?;

        let volatility_factor = volatility_factor(signal.market_volatility);
        let confidence_factor = signal.confidence;
        let performance_factor = performance_factor(stats);
        let risk_percentage = self.risk_percentage(
            volatility_factor,
            confidence_factor,
            performance_factor,
        )?;
        let kelly_fraction = kelly_fraction(stats);

        let params = RiskParams {
            available_balance,
            volatility_factor,
            confidence_factor,
            performance_factor,
            risk_percentage,
            kelly_fraction,
        };

        if available_balance <= Decimal::ZERO {
            debug!(
                balance = %balance,
                committed = %committed,
                "No available balance after committed margin"
            );
            return Ok(SizingDecision {
                size: Decimal::ZERO,
                params,
            });
        }

        let size = available_balance
            .checked_mul(risk_percentage)
            .and_then(|v| v.checked_div(dec!(100)))
            .and_then(|v| v.checked_mul(kelly_fraction))
            .ok_or(ValidationError::Overflow { field: "size" })?;

        debug!(
            available = %available_balance,
            risk_pct = %risk_percentage,
            kelly = %kelly_fraction,
            size = %size,
            "Computed position size"
        );

        Ok(SizingDecision { size, params })
    }

    /// Reject inputs that cannot be sized. Nothing is clamped here.
    pub fn validate(&self, balance: Decimal, signal: &Signal) -> Result<(), ValidationError> {
        if balance < Decimal::ZERO {
            return Err(ValidationError::Negative {
                field: "balance",
                value: balance,
            });
        }

        validate_signal(signal)?;

        let leverage = signal.suggested_leverage;
        if leverage < self.config.min_leverage || leverage > self.config.max_leverage {
            return Err(ValidationError::LeverageOutOfRange {
                value: leverage,
                min: self.config.min_leverage,
                max: self.config.max_leverage,
            });
        }

        Ok(())
    }

    /// `base_risk * volatility * confidence * performance`, clamped to [0.5, 5.0].
    pub fn risk_percentage(
        &self,
        volatility_factor: Decimal,
        confidence_factor: Decimal,
        performance_factor: Decimal,
    ) -> Result<Decimal, ValidationError> {
        let adjusted = self
            .config
            .base_risk_pct
            .checked_mul(volatility_factor)
            .and_then(|v| v.checked_mul(confidence_factor))
            .and_then(|v| v.checked_mul(performance_factor))
            .ok_or(ValidationError::Overflow { field: "risk_percentage" })?;
        Ok(adjusted.clamp(MIN_RISK_PCT, MAX_RISK_PCT))
    }
}

/// Reject a signal that cannot drive any decision: confidence outside
/// [0, 1], non-positive prices or negative volatility. Leverage is checked
/// only where it is used, by `RiskEngine::validate`.
pub fn validate_signal(signal: &Signal) -> Result<(), ValidationError> {
    if signal.confidence < Decimal::ZERO || signal.confidence > Decimal::ONE {
        return Err(ValidationError::ConfidenceOutOfRange(signal.confidence));
    }

    if signal.current_price <= Decimal::ZERO {
        return Err(ValidationError::NonPositive {
            field: "current_price",
            value: signal.current_price,
        });
    }

    if let Some(entry) = signal.suggested_entry {
        if entry <= Decimal::ZERO {
            return Err(ValidationError::NonPositive {
                field: "suggested_entry",
                value: entry,
            });
        }
    }

    if signal.market_volatility < Decimal::ZERO {
        return Err(ValidationError::Negative {
            field: "market_volatility",
            value: signal.market_volatility,
        });
    }

    Ok(())
}

/// `1 - volatility/100`. Goes negative above 100%; the risk clamp absorbs it.
pub fn volatility_factor(market_volatility: Decimal) -> Decimal {
    Decimal::ONE - market_volatility / dec!(100)
}

/// Scale risk by recent results: `0.5 + recent win rate`, bounded to
/// [0.5, 1.5]. A 50% win rate (or no recent trades) leaves risk unchanged.
pub fn performance_factor(stats: &HistoryStats) -> Decimal {
    match stats.recent_win_rate() {
        Some(win_rate) => {
            (dec!(0.5) + win_rate).clamp(MIN_PERFORMANCE_FACTOR, MAX_PERFORMANCE_FACTOR)
        }
        None => Decimal::ONE,
    }
}

/// Kelly criterion from the history aggregate, clamped to [0, 0.5].
///
/// f* = p - q / b
/// where:
///   p = win rate over counted (non break-even) trades
///   q = 1 - p
///   b = average win / average loss
///
/// Falls back to 0.5 with no history or no recorded loss magnitude.
pub fn kelly_fraction(stats: &HistoryStats) -> Decimal {
    let counted = stats.counted_trades();
    if stats.total_closed == 0 || counted == 0 {
        return DEFAULT_KELLY;
    }

    let win_rate = Decimal::from(stats.win_count) / Decimal::from(counted);

    let avg_win = if stats.win_count == 0 {
        Decimal::ZERO
    } else {
        stats.sum_win_pnl / Decimal::from(stats.win_count)
    };
    let avg_loss = if stats.loss_count == 0 {
        Decimal::ZERO
    } else {
        stats.sum_loss_pnl.abs() / Decimal::from(stats.loss_count)
    };

    if avg_loss.is_zero() {
        return DEFAULT_KELLY;
    }

    let Some(win_loss_ratio) = avg_win.checked_div(avg_loss) else {
        // Ratio beyond Decimal range: the loss term vanishes
        return win_rate.clamp(Decimal::ZERO, MAX_KELLY);
    };
    if win_loss_ratio.is_zero() {
        // No winning edge at all: the formula tends to -inf
        return Decimal::ZERO;
    }

    let kelly = win_rate - (Decimal::ONE - win_rate) / win_loss_ratio;
    kelly.clamp(Decimal::ZERO, MAX_KELLY)
}
