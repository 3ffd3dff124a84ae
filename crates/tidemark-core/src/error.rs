use thiserror::Error;

/// Top-level error type for the Tidemark system.
///
/// Routine background work (appends, snapshots, deliveries) logs these and
/// carries on; only on-demand operations hand them back to a caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TidemarkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage quota exceeded: {size} bytes exceeds {limit} bytes")]
    QuotaExceeded { size: usize, limit: usize },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Content extraction failed: {0}")]
    Extraction(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl TidemarkError {
    /// Whether this error is a storage quota exhaustion.
    pub fn is_quota(&self) -> bool {
        matches!(self, TidemarkError::QuotaExceeded { .. })
    }
}

impl From<toml::de::Error> for TidemarkError {
    fn from(err: toml::de::Error) -> Self {
        TidemarkError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TidemarkError {
    fn from(err: toml::ser::Error) -> Self {
        TidemarkError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TidemarkError {
    fn from(err: serde_json::Error) -> Self {
        TidemarkError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tidemark operations.
pub type Result<T> = std::result::Result<T, TidemarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TidemarkError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_quota_display_and_predicate() {
        let err = TidemarkError::QuotaExceeded {
            size: 100,
            limit: 50,
        };
        assert_eq!(
            err.to_string(),
            "Storage quota exceeded: 100 bytes exceeds 50 bytes"
        );
        assert!(err.is_quota());
        assert!(!TidemarkError::Storage("disk".into()).is_quota());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TidemarkError = io_err.into();
        assert!(matches!(err, TidemarkError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: TidemarkError = err.unwrap_err().into();
        assert!(matches!(err, TidemarkError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: TidemarkError = err.unwrap_err().into();
        assert!(matches!(err, TidemarkError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(format!("got {}", value))
        }

        assert_eq!(inner().unwrap(), "got 42");
    }
}
