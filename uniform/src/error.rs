//! Registry error types

use thiserror::Error;

use crate::validation::ValidationError;

/// Result type alias for registry operations
pub type UniformResult<T> = Result<T, UniformError>;

/// Errors that can occur during registry operations
#[derive(Error, Debug)]
pub enum UniformError {
    /// Payload violates a filter invariant; rejected before any mutation
    #[error("invalid subscription: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed error log batch
    #[error("invalid log entry: {0}")]
    InvalidLog(String),

    /// Integration or subscription does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate-key condition on insert
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Backing store failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl UniformError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// HTTP status code this error maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidLog(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::Storage(_) => 500,
        }
    }
}

impl From<std::io::Error> for UniformError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for UniformError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// JSON error body returned by the HTTP surface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            UniformError::from(ValidationError::MissingEvent).http_status(),
            400
        );
        assert_eq!(UniformError::not_found("x").http_status(), 404);
        assert_eq!(UniformError::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(UniformError::Storage("disk".into()).http_status(), 500);
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(UniformError::not_found("integration abc").is_not_found());
        assert!(!UniformError::Storage("down".into()).is_not_found());
    }
}
