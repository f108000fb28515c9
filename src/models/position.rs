//! Open leveraged positions and their closed history records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::Side;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "manual" => Ok(CloseReason::Manual),
            other => anyhow::bail!("Unknown close reason: {}", other),
        }
    }
}

/// A currently open leveraged position.
///
/// Direction, entry price and entry time are fixed for the life of the
/// position; only `size` and `margin` change, through a resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier assigned at creation
    pub id: String,

    /// Instrument symbol (e.g. "XBTUSDTM")
    pub symbol: String,

    /// Long or short
    pub side: Side,

    /// Fill price at open
    pub entry_price: Decimal,

    /// Committed size in account currency
    pub size: Decimal,

    /// Leverage multiplier
    pub leverage: u32,

    /// Margin reserved for this position
    pub margin: Decimal,

    /// Stop-loss threshold, in the same scale as `pnl_at`
    pub stop_loss_pct: Decimal,

    /// Take-profit threshold, in the same scale as `pnl_at`
    pub take_profit_pct: Decimal,

    /// When the position was opened
    pub entry_time: DateTime<Utc>,
}

impl Position {
    /// Open a new position with a fresh id. Margin is `size / leverage`.
    pub fn open(
        symbol: String,
        side: Side,
        entry_price: Decimal,
        size: Decimal,
        leverage: u32,
        stop_loss_pct: Decimal,
        take_profit_pct: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol,
            side,
            entry_price,
            size,
            leverage,
            margin: size / Decimal::from(leverage.max(1)),
            stop_loss_pct,
            take_profit_pct,
            entry_time: Utc::now(),
        }
    }

    /// P&L at `current_price`, scaled by size and leverage.
    ///
    /// `(price_diff / entry_price) * size * leverage`, with the price move
    /// negated for shorts. The result is a magnitude in account currency, not
    /// a bounded percentage, and the stop/take thresholds are compared
    /// against it directly.
    ///
    /// `None` when the result leaves the decimal range.
    pub fn pnl_at(&self, current_price: Decimal) -> Option<Decimal> {
        if self.entry_price.is_zero() {
            return Some(Decimal::ZERO);
        }
        current_price
            .checked_sub(self.entry_price)?
            .checked_mul(self.side.sign())?
            .checked_div(self.entry_price)?
            .checked_mul(self.size)?
            .checked_mul(Decimal::from(self.leverage))
    }

    /// Copy of this position at `new_size`, with margin scaled proportionally.
    pub fn resized(&self, new_size: Decimal) -> Self {
        let by_leverage = new_size / Decimal::from(self.leverage.max(1));
        let margin = self
            .margin
            .checked_mul(new_size)
            .and_then(|scaled| scaled.checked_div(self.size))
            .unwrap_or(by_leverage);

        Self {
            size: new_size,
            margin,
            ..self.clone()
        }
    }

    /// Build the history record for closing this position at `exit_price`.
    /// `None` when the realized P&L overflows.
    pub fn close(
        &self,
        exit_price: Decimal,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Option<ClosedPosition> {
        let duration_seconds = (closed_at - self.entry_time).num_seconds().max(0);

        Some(ClosedPosition {
            id: self.id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            entry_price: self.entry_price,
            exit_price,
            size: self.size,
            leverage: self.leverage,
            pnl: self.pnl_at(exit_price)?,
            reason,
            duration_seconds,
            closed_at,
        })
    }
}

/// Immutable record of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    /// Id the position carried while open
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub leverage: u32,

    /// Realized P&L, same formula as `Position::pnl_at`
    pub pnl: Decimal,

    pub reason: CloseReason,

    /// Seconds between open and close, never negative
    pub duration_seconds: i64,

    pub closed_at: DateTime<Utc>,
}

impl ClosedPosition {
    pub fn is_win(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.pnl < Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn make_position(side: Side) -> Position {
        Position::open(
            "XBTUSDTM".to_string(),
            side,
            dec!(100),
            dec!(10),
            5,
            dec!(400),
            dec!(400),
        )
    }

    #[test]
    fn test_pnl_scaled_by_size_and_leverage() {
        let pos = make_position(Side::Long);

        // (-10 / 100) * 10 * 5 = -5
        assert_eq!(pos.pnl_at(dec!(90)), Some(dec!(-5)));
        assert_eq!(pos.pnl_at(dec!(110)), Some(dec!(5)));
        assert_eq!(pos.pnl_at(dec!(100)), Some(Decimal::ZERO));
    }

    #[test]
    fn test_pnl_sign_inverts_for_short() {
        let long = make_position(Side::Long);
        let short = make_position(Side::Short);

        for price in [dec!(80), dec!(95.5), dec!(130)] {
            assert_eq!(long.pnl_at(price).unwrap(), -short.pnl_at(price).unwrap());
        }
        assert!(short.pnl_at(dec!(90)).unwrap() > Decimal::ZERO);
    }

    #[test]
    fn test_margin_and_resize() {
        let pos = make_position(Side::Long);
        assert_eq!(pos.margin, dec!(2)); // 10 / 5

        let resized = pos.resized(dec!(25));
        assert_eq!(resized.size, dec!(25));
        assert_eq!(resized.margin, dec!(5));
        assert_eq!(resized.id, pos.id);
        assert_eq!(resized.entry_price, pos.entry_price);
        assert_eq!(resized.side, pos.side);
        assert_eq!(resized.entry_time, pos.entry_time);
    }

    #[test]
    fn test_close_builds_record() {
        let pos = make_position(Side::Short);
        let closed_at = pos.entry_time + Duration::seconds(90);

        let record = pos.close(dec!(90), CloseReason::TakeProfit, closed_at).unwrap();
        assert_eq!(record.id, pos.id);
        assert_eq!(record.pnl, dec!(5));
        assert_eq!(record.duration_seconds, 90);
        assert!(record.is_win());

        // A clock that went backwards still yields a non-negative duration
        let record = pos
            .close(dec!(90), CloseReason::Manual, pos.entry_time - Duration::seconds(5))
            .unwrap();
        assert_eq!(record.duration_seconds, 0);
    }

    #[test]
    fn test_pnl_overflow_is_none() {
        let pos = Position::open(
            "XBTUSDTM".to_string(),
            Side::Long,
            dec!(0.0001),
            Decimal::MAX,
            125,
            dec!(400),
            dec!(400),
        );

        assert_eq!(pos.pnl_at(dec!(1000)), None);
        assert!(pos.close(dec!(1000), CloseReason::Manual, Utc::now()).is_none());
        // No price move stays representable
        assert_eq!(pos.pnl_at(dec!(0.0001)), Some(Decimal::ZERO));
    }

    #[test]
    fn test_close_reason_round_trip_str() {
        for reason in [CloseReason::StopLoss, CloseReason::TakeProfit, CloseReason::Manual] {
            assert_eq!(reason.as_str().parse::<CloseReason>().unwrap(), reason);
        }
    }
}
