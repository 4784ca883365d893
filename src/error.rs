use thiserror::Error;

/// Crate-wide error taxonomy. Validation and not-found kinds are stable and
/// matchable; I/O and serialization failures are carried transparently.
#[derive(Error, Debug)]
pub enum Error {
    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("document already exists: {0}")]
    DocumentExists(String),

    #[error("no results found")]
    NoResultsFound,

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("failed to create index: {0}")]
    FailedToCreateIndex(String),

    #[error("failed to load index: {0}")]
    FailedToLoadIndex(String),

    #[error("unsupported index type: {0}")]
    UnsupportedIndexType(String),

    #[error("keys and values length mismatch")]
    MismatchKeysValues,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("empty parameter: {0}")]
    EmptyParameter(String),

    /// Bad magic, truncated footer, checksum mismatch and the like. Fails
    /// the enclosing open/load.
    #[error("corrupted file: {0}")]
    Corruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_matchable() {
        let err = Error::CollectionExists("test".into());
        assert!(matches!(err, Error::CollectionExists(_)));
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
