//! Shared error taxonomy for administrative operations.

use thiserror::Error;

/// Errors surfaced by the controller, the property store, and the DAO.
///
/// The first four variants are synchronous caller errors. A
/// `DependencyUnavailable` raised during activation is caught inside the
/// monitor's poll, logged, and retried on the next poll; it never corrupts a
/// run record.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(anyhow::Error::new(e))
    }
}

impl From<r2d2::Error> for AppError {
    fn from(e: r2d2::Error) -> Self {
        AppError::Internal(anyhow::Error::new(e))
    }
}

/// Convenience alias used throughout the crate.
pub type AppResult<T> = Result<T, AppError>;
