//! Error types for store and model operations.
//!
//! Store implementations translate driver failures into [`CoreError`] so the
//! coordination layer can tell conflicts from transient failures without
//! knowing which backend it talks to.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for store operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The store could not be reached at all.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl CoreError {
    /// Returns whether a later attempt of the same call may succeed.
    ///
    /// Constraint violations and invalid input are deterministic; database
    /// and availability failures are treated as transient.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested record not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
