// Engine error taxonomy
//
// Every failure a caller can see maps to exactly one variant here, so the
// API layer can render a stable status without inspecting internals.
// Business outcomes (no match, insufficient funds) are never retried;
// storage faults surface as Unavailable only after the bounded retry in
// the storage layer is exhausted.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors returned by the ledger engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Unknown or deactivated account
    #[error("account not found: {0}")]
    NotFound(String),

    /// No biometric match, or an ambiguous one. Callers never learn which.
    #[error("authentication failed")]
    AuthFailed,

    /// Session token was valid once but its time-to-live has passed
    #[error("session expired")]
    Expired,

    /// Session token was never issued or has been destroyed
    #[error("invalid session token")]
    Invalid,

    /// Withdrawal larger than the committed balance at the time of the check
    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    /// Non-positive or unparseable amount
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Amount exceeds the configured single-transaction limit
    #[error("amount {requested} exceeds single-transaction limit {limit}")]
    LimitExceeded { requested: Decimal, limit: Decimal },

    /// Presented template has the wrong dimension for this deployment
    #[error("template dimension mismatch: expected {expected}, got {actual}")]
    TemplateMismatch { expected: usize, actual: usize },

    /// Template contains values that cannot be a feature vector
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    /// Persistence failed after bounded retries were exhausted
    #[error("storage unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },
}

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_messages_are_stable() {
        let err = EngineError::InsufficientFunds {
            requested: dec!(200.00),
            available: dec!(150.00),
        };
        assert_eq!(
            err.to_string(),
            "insufficient funds: requested 200.00, available 150.00"
        );

        let err = EngineError::LimitExceeded {
            requested: dec!(50000),
            limit: dec!(10000),
        };
        assert_eq!(
            err.to_string(),
            "amount 50000 exceeds single-transaction limit 10000"
        );
    }

    #[test]
    fn test_auth_failed_does_not_leak_details() {
        // One message for no-match and ambiguous alike
        assert_eq!(EngineError::AuthFailed.to_string(), "authentication failed");
    }
}
