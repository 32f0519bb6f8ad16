//! Error types for the transfer relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for network {network}: {message}")]
    ChainConnection { network: String, message: String },

    #[error("Network {0} is not configured")]
    UnsupportedNetwork(String),

    #[error("Currency {currency} is not supported on network {network}")]
    UnsupportedCurrency { currency: String, network: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Gas simulation failed: {0}")]
    GasSimulationFailed(String),

    #[error("Fee estimation error: {0}")]
    FeeEstimation(String),

    #[error("Nonce conflict for {key} at nonce {nonce}: {message}")]
    NonceConflict {
        key: String,
        nonce: u64,
        message: String,
    },

    #[error("Signing rejected: {0}")]
    SigningRejected(String),

    #[error("Signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("Submission rejected on network {network}: {reason}")]
    SubmissionRejected { network: String, reason: String },

    #[error("Nonce already consumed on network {network}")]
    NonceTooLow { network: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Submission {tx_hash} not found")]
    SubmissionNotFound { tx_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure classes reported to the payment layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any network call
    InputValidation,
    /// The transfer would revert
    SimulationFailure,
    /// Two builds raced for one nonce
    NonceConflict,
    SigningFailure,
    /// Retryable only through a fresh build cycle
    SubmissionFailure,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputValidation => "input_validation",
            ErrorKind::SimulationFailure => "simulation_failure",
            ErrorKind::NonceConflict => "nonce_conflict",
            ErrorKind::SigningFailure => "signing_failure",
            ErrorKind::SubmissionFailure => "submission_failure",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl RelayerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayerError::UnsupportedNetwork(_)
            | RelayerError::UnsupportedCurrency { .. }
            | RelayerError::InvalidAddress(_)
            | RelayerError::InvalidAmount(_) => ErrorKind::InputValidation,
            RelayerError::GasSimulationFailed(_) => ErrorKind::SimulationFailure,
            RelayerError::NonceConflict { .. } => ErrorKind::NonceConflict,
            RelayerError::SigningRejected(_) | RelayerError::SigningUnavailable(_) => {
                ErrorKind::SigningFailure
            }
            RelayerError::SubmissionRejected { .. } | RelayerError::NonceTooLow { .. } => {
                ErrorKind::SubmissionFailure
            }
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Check if error is retryable
    ///
    /// Retrying always means a fresh build cycle with a new nonce reservation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::SigningUnavailable(_)
                | RelayerError::FeeEstimation(_)
                | RelayerError::NonceTooLow { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::NonceConflict { .. }
                | RelayerError::SigningRejected(_)
                | RelayerError::InvalidStateTransition { .. }
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_errors_are_not_retryable() {
        let err = RelayerError::UnsupportedCurrency {
            currency: "DOGE".to_string(),
            network: "base".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InputValidation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_nonce_conflict_alerts() {
        let err = RelayerError::NonceConflict {
            key: "base:0x01".to_string(),
            nonce: 7,
            message: "slot already held".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NonceConflict);
        assert!(err.should_alert());
    }

    #[test]
    fn test_signing_unavailable_is_transient() {
        let err = RelayerError::SigningUnavailable("503".to_string());
        assert_eq!(err.kind(), ErrorKind::SigningFailure);
        assert!(err.is_retryable());
        assert!(!RelayerError::SigningRejected("401".to_string()).is_retryable());
    }
}
