use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors surfaced by the repository core.
///
/// Validation failures (`Stale`, `Constraint`, `AccessDenied`, `Locked`,
/// `Versioning`) are raised before any persistent mutation takes place;
/// `Io` during the mutation phase aborts the commit and discards the
/// in-flight shared caches.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("stale item state: {0}")]
    Stale(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("locked: {0}")]
    Locked(String),
    #[error("versioning: {0}")]
    Versioning(String),
}

impl RepoError {
    /// True for the validation-phase failures that leave the session's
    /// pending changes intact.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RepoError::Stale(_)
                | RepoError::Constraint(_)
                | RepoError::AccessDenied(_)
                | RepoError::Locked(_)
                | RepoError::Versioning(_)
        )
    }
}
