use thiserror::Error;

/// Top-level error type for the PIM storage engine.
///
/// The first six variants are the failure kinds surfaced to users of the
/// storage engine and the migrator. The remaining ones cover internal
/// misuse (transaction nesting, unknown rows) and plumbing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PimError {
    /// Invalid or missing configuration, e.g. an unknown database engine.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The database could not be opened or the connection is gone.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A SQL statement failed. Carries the driver's error text.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Writing, renaming or deleting a payload file failed.
    #[error("Payload I/O error: {0}")]
    PayloadIo(String),

    #[error("Declined by user: {0}")]
    UserDeclined(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A payload stream did not deliver what its metadata announced.
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PimError {
    /// Wrap an I/O failure on a payload file, keeping the path in the message.
    pub fn payload_io(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        PimError::PayloadIo(format!("{}: {}", path.display(), err))
    }
}

impl From<toml::de::Error> for PimError {
    fn from(err: toml::de::Error) -> Self {
        PimError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PimError {
    fn from(err: toml::ser::Error) -> Self {
        PimError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PimError {
    fn from(err: serde_json::Error) -> Self {
        PimError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, PimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let cases: Vec<(PimError, &str)> = vec![
            (
                PimError::Config("bad driver".to_string()),
                "Configuration error: bad driver",
            ),
            (
                PimError::Connection("no such file".to_string()),
                "Connection error: no such file",
            ),
            (
                PimError::Integrity("UNIQUE constraint failed".to_string()),
                "Integrity error: UNIQUE constraint failed",
            ),
            (
                PimError::UserDeclined("no backup".to_string()),
                "Declined by user: no backup",
            ),
            (
                PimError::Timeout("server start".to_string()),
                "Timed out: server start",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_payload_io_includes_path() {
        let err = PimError::payload_io(std::path::Path::new("/tmp/12_r0"), "disk full");
        assert!(matches!(err, PimError::PayloadIo(_)));
        assert_eq!(err.to_string(), "Payload I/O error: /tmp/12_r0: disk full");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PimError = io_err.into();
        assert!(matches!(err, PimError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("driver = [[[");
        let err: PimError = err.unwrap_err().into();
        assert!(matches!(err, PimError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: PimError = err.unwrap_err().into();
        assert!(matches!(err, PimError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
