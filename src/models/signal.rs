//! Market signal model produced once per instrument per cycle.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position or signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "buy")]
    Long,
    #[serde(alias = "sell")]
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// The other direction.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short. Multiplies a raw price move into P&L direction.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => anyhow::bail!("Unknown side: {}", other),
        }
    }
}

/// Analysis output for a single instrument.
///
/// Read once per cycle and never modified afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Expected market direction
    pub direction: Side,

    /// Model confidence (0.0 to 1.0)
    pub confidence: Decimal,

    /// Last traded price
    pub current_price: Decimal,

    /// Limit price to enter at; `None` means enter at market
    #[serde(default)]
    pub suggested_entry: Option<Decimal>,

    /// Leverage the analysis recommends
    pub suggested_leverage: u32,

    /// Market volatility as a percentage (nominally 0-100)
    #[serde(default)]
    pub market_volatility: Decimal,
}

impl Signal {
    /// Whether this signal points against a position held on `side`.
    pub fn opposes(&self, side: Side) -> bool {
        self.direction == side.opposite()
    }
}
