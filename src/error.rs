use crate::domain::status::PaymentStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    /// Bad input to `start` or an empty settlement reference.
    #[error("validation error: {0}")]
    Validation(String),

    /// A gateway event referenced an external id this process does not own.
    #[error("unknown payment: {0}")]
    UnknownPayment(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("payment {internal_id} cannot move from {from} to {to}")]
    IllegalTransition {
        internal_id: String,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("payment {internal_id} cannot be {action} while {status}")]
    InvalidState {
        internal_id: String,
        status: PaymentStatus,
        action: &'static str,
    },

    /// Network or timeout class failure from a remote service. The only retryable error.
    #[error("transient service error: {0}")]
    TransientService(String),

    #[error("denied: {0}")]
    TerminalDenial(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PaymentError::TransientService(_))
    }
}
