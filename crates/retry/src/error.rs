use rust_decimal::Decimal;
use thiserror::Error;

use legsync_core::LegStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("Tolerance {0}% is outside [0, 100)")]
    InvalidTolerance(Decimal),

    #[error("Target odds {0} must be positive")]
    InvalidTarget(Decimal),

    #[error("Only failed legs can be registered for retry, leg is {0}")]
    LegNotFailed(LegStatus),
}
