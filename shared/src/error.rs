use crate::money::Money;
use crate::store::StorePath;
use serde::Serialize;
use thiserror::Error;

/// Broad category of a failure, used by callers to decide between retrying
/// and surfacing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    InvalidInput,
    InsufficientFunds,
    VerificationInProgress,
    StorageUnavailable,
    PermissionDenied,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("no user matches {0}")]
    UserNotFound(String),

    #[error("job {job_id} is full: {max_count} of {max_count} completions already recorded")]
    JobFull { job_id: String, max_count: u32 },

    #[error("submission {submission_id} was already reviewed ({status})")]
    AlreadyReviewed { submission_id: String, status: String },

    #[error("{queue} request {id} was already processed ({status})")]
    AlreadyProcessed {
        queue: &'static str,
        id: String,
        status: String,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("insufficient {field} balance for user {user_id}: has ${balance}, needs ${requested}")]
    InsufficientFunds {
        user_id: String,
        field: &'static str,
        balance: Money,
        requested: Money,
    },

    #[error("user {user_id} already has verification request {request_id} pending")]
    VerificationInProgress { user_id: String, request_id: String },

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("concurrent updates kept conflicting on {path} after {attempts} attempts")]
    Conflict { path: StorePath, attempts: u32 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("corrupt document at {path}: {message}")]
    Serialization { path: String, message: String },
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::UserNotFound(_) => ErrorKind::NotFound,
            Self::JobFull { .. }
            | Self::AlreadyReviewed { .. }
            | Self::AlreadyProcessed { .. }
            | Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::VerificationInProgress { .. } => ErrorKind::VerificationInProgress,
            Self::InvalidInput(_) | Self::Serialization { .. } => ErrorKind::InvalidInput,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Conflict { .. } | Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Only transient storage failures are worth retrying; everything else
    /// reports a business rule and is surfaced verbatim.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StorageUnavailable
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
