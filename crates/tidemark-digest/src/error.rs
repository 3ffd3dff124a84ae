use thiserror::Error;

use tidemark_core::error::TidemarkError;

/// Errors that can occur while building, delivering or scheduling digests.
#[derive(Error, Debug)]
pub enum DigestError {
    #[error("{0}")]
    Core(#[from] TidemarkError),
    #[error("delivery to {sink} failed: {message}")]
    Delivery { sink: String, message: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<DigestError> for TidemarkError {
    fn from(err: DigestError) -> Self {
        match err {
            DigestError::Core(e) => e,
            DigestError::Config(msg) => TidemarkError::Config(msg),
            DigestError::Io(e) => TidemarkError::Io(e),
            other => TidemarkError::Delivery(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_delivery() {
        let e = DigestError::Delivery {
            sink: "webhook".to_string(),
            message: "503".to_string(),
        };
        assert_eq!(e.to_string(), "delivery to webhook failed: 503");
    }

    #[test]
    fn test_core_error_passes_through() {
        let e: DigestError = TidemarkError::Storage("locked".into()).into();
        assert_eq!(e.to_string(), "Storage error: locked");

        let back: TidemarkError = e.into();
        assert!(matches!(back, TidemarkError::Storage(_)));
    }

    #[test]
    fn test_delivery_maps_to_core_delivery() {
        let e = DigestError::Delivery {
            sink: "file".to_string(),
            message: "read-only".to_string(),
        };
        let core: TidemarkError = e.into();
        assert!(matches!(core, TidemarkError::Delivery(msg) if msg.contains("read-only")));
    }
}
