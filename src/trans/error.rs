//! Transaction Store Error Types

use thiserror::Error;

use super::state::GlobalStatus;

/// Errors raised by the stores, the processor and the coordinator facade.
///
/// `NotFound` covers both "no such row" and "lost a CAS/lease race"; callers
/// reload before deciding whether to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransError {
    #[error("Transaction not found or precondition no longer holds")]
    NotFound,

    #[error("Duplicate submission (gid already registered)")]
    DuplicateSubmission,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: GlobalStatus,
        to: GlobalStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

impl TransError {
    /// Stable error code for the API layer
    pub fn code(&self) -> &'static str {
        match self {
            TransError::NotFound => "NOT_FOUND",
            TransError::DuplicateSubmission => "DUPLICATE_SUBMISSION",
            TransError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            TransError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TransError::InvalidRequest(_) => "INVALID_REQUEST",
            TransError::Corrupted(_) => "CORRUPTED_RECORD",
        }
    }

    /// Transient for the scheduler: the next poll may succeed without
    /// anyone changing the record
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransError::StoreUnavailable(_) | TransError::NotFound)
    }
}

impl From<sqlx::Error> for TransError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => TransError::NotFound,
            other => TransError::StoreUnavailable(other.to_string()),
        }
    }
}
