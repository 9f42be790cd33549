use thiserror::Error;

/// Errors raised by the record store and its blob backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Version conflict on '{path}': the blob changed since it was loaded")]
    Conflict { path: String },

    #[error("Malformed table: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Create a conflict error for the given blob path
    pub fn conflict(path: impl Into<String>) -> Self {
        Self::Conflict { path: path.into() }
    }

    /// Create a backend error from a message
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a malformed-table error from a message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<csv::Error> for StoreError {
    fn from(err: csv::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::conflict("health.csv");
        assert_eq!(
            err.to_string(),
            "Version conflict on 'health.csv': the blob changed since it was loaded"
        );

        let err = StoreError::NotFound("health.csv".to_string());
        assert!(err.to_string().contains("health.csv"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(StoreError::conflict("a").is_conflict());
        assert!(!StoreError::backend("timeout").is_conflict());
        assert!(StoreError::NotFound("a".to_string()).is_not_found());
        assert!(!StoreError::malformed("x").is_not_found());
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
