use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferEngineError>;

#[derive(Error, Debug)]
pub enum TransferEngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Legacy transfer list error: {0}")]
    LegacyFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_pickle::Error> for TransferEngineError {
    fn from(err: serde_pickle::Error) -> Self {
        TransferEngineError::LegacyFormat(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreadable_pickle_is_a_legacy_format_error() {
        let err = serde_pickle::value_from_slice(b"", serde_pickle::DeOptions::new())
            .unwrap_err();

        let err = TransferEngineError::from(err);
        assert!(matches!(err, TransferEngineError::LegacyFormat(_)));
        assert!(err.to_string().starts_with("Legacy transfer list error"));
    }
}
