use chrono::{DateTime, Utc};
use thiserror::Error;

/// Malformed signal shape. Dropped and logged, never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Signal symbol is empty")]
    EmptySymbol,

    #[error("Invalid price: {0}")]
    InvalidPrice(f64),

    #[error("Confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("HOLD signals are not actionable")]
    NotActionable,

    #[error("Timestamp {got} for {symbol} precedes last accepted signal at {last}")]
    TimestampRegression {
        symbol: String,
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },

    #[error("Invalid feature snapshot: {0}")]
    InvalidFeatures(String),
}
