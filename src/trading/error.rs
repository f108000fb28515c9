//! Typed errors raised by the sizing and lifecycle core.

use rust_decimal::Decimal;

/// Input rejected before any sizing computation runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(Decimal),

    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: Decimal },

    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: Decimal },

    #[error("leverage {value} outside configured range [{min}, {max}]")]
    LeverageOutOfRange { value: u32, min: u32, max: u32 },

    #[error("{field} overflows the decimal range")]
    Overflow { field: &'static str },
}

/// Static configuration that cannot be run with. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("leverage range is inverted: min {min} > max {max}")]
    InvertedLeverageRange { min: u32, max: u32 },
}

/// Failure to close a position.
#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("position {0} is not open")]
    NotOpen(String),

    #[error("position {0} has another change in flight")]
    InFlight(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to persist close of {id}")]
    Persistence {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}
