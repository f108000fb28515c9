//! Risk and lifecycle configuration.

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::error::ConfigError;

const ENV_PREFIX: &str = "LEVSIZER_";

/// Configuration for position sizing and lifecycle rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Base risk per trade as a percentage of available balance
    pub base_risk_pct: Decimal,

    /// Lowest leverage a signal may suggest
    pub min_leverage: u32,

    /// Highest leverage a signal may suggest
    pub max_leverage: u32,

    /// Maximum concurrent positions. Reported only, not enforced.
    pub max_positions: usize,

    /// Confidence a signal must exceed to open a new position
    pub entry_confidence_threshold: Decimal,

    /// Confidence an opposing signal must exceed to trigger a resize
    pub resize_confidence_threshold: Decimal,

    /// Stop-loss threshold given to new positions (P&L scale, see `Position::pnl_at`)
    pub stop_loss_pct: Decimal,

    /// Take-profit threshold given to new positions (P&L scale)
    pub take_profit_pct: Decimal,

    /// Number of recent closed trades feeding the performance factor
    pub performance_window: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_risk_pct: dec!(2.0),               // 2% risk per trade
            min_leverage: 1,
            max_leverage: 20,
            max_positions: 5,
            entry_confidence_threshold: dec!(0.6),
            resize_confidence_threshold: dec!(0.8),
            stop_loss_pct: dec!(5.0),
            take_profit_pct: dec!(10.0),
            performance_window: 20,
        }
    }
}

impl RiskConfig {
    /// Load configuration from `LEVSIZER_*` environment variables.
    ///
    /// Reads a `.env` file first if one exists. Unset variables keep their
    /// defaults. The result is validated before it is returned.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            base_risk_pct: env_or("BASE_RISK_PCT", defaults.base_risk_pct)?,
            min_leverage: env_or("MIN_LEVERAGE", defaults.min_leverage)?,
            max_leverage: env_or("MAX_LEVERAGE", defaults.max_leverage)?,
            max_positions: env_or("MAX_POSITIONS", defaults.max_positions)?,
            entry_confidence_threshold: env_or(
                "ENTRY_CONFIDENCE",
                defaults.entry_confidence_threshold,
            )?,
            resize_confidence_threshold: env_or(
                "RESIZE_CONFIDENCE",
                defaults.resize_confidence_threshold,
            )?,
            stop_loss_pct: env_or("STOP_LOSS_PCT", defaults.stop_loss_pct)?,
            take_profit_pct: env_or("TAKE_PROFIT_PCT", defaults.take_profit_pct)?,
            performance_window: env_or("PERFORMANCE_WINDOW", defaults.performance_window)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_leverage == 0 {
            return Err(ConfigError::InvalidValue(
                "min_leverage must be at least 1".into(),
            ));
        }

        if self.min_leverage > self.max_leverage {
            return Err(ConfigError::InvertedLeverageRange {
                min: self.min_leverage,
                max: self.max_leverage,
            });
        }

        if self.base_risk_pct <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "base_risk_pct must be greater than 0".into(),
            ));
        }

        for (name, value) in [
            ("entry_confidence_threshold", self.entry_confidence_threshold),
            ("resize_confidence_threshold", self.resize_confidence_threshold),
        ] {
            if value < Decimal::ZERO || value > Decimal::ONE {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be between 0 and 1",
                    name
                )));
            }
        }

        if self.stop_loss_pct <= Decimal::ZERO || self.take_profit_pct <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue(
                "stop_loss_pct and take_profit_pct must be greater than 0".into(),
            ));
        }

        if self.performance_window == 0 {
            return Err(ConfigError::InvalidValue(
                "performance_window must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{}{}", ENV_PREFIX, key);
    match std::env::var(&name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", name, raw)),
        Err(_) => Ok(default),
    }
}
