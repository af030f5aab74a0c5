use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("object `{0}` was never completed")]
    IncompleteObject(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("malformed identifier `{0}`")]
    InvalidId(String),
    #[error("admin access only")]
    Forbidden,
    #[error("upload interrupted: {0}")]
    Interrupted(#[source] io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl ServiceError {
    /// True for failures of the durable store rather than of the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Sqlx(_))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
