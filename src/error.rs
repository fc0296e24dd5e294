/// Reasons a Service 42 payload is rejected by [`crate::protocol::DeviceReading::decode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("non-hex character at position {position}")]
    InvalidHex { position: usize },
    #[error("payload of {length} chars is shorter than the header")]
    TruncatedHeader { length: usize },
    /// The overall payload length disagrees with the INFO length declared in the header.
    #[error("length mismatch: header declares {info_len_chars} INFO chars, expected total {expected}, received {actual}")]
    LengthMismatch {
        info_len_chars: usize,
        expected: usize,
        actual: usize,
    },
    #[error("field '{field}' needs {needed} chars at position {position}, INFO block has {available}")]
    TruncatedField {
        field: &'static str,
        needed: usize,
        position: usize,
        available: usize,
    },
    /// The field table consumed a different number of chars than the INFO block holds.
    #[error("INFO block holds {expected} chars, fields consumed {consumed}")]
    FieldCountMismatch { expected: usize, consumed: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("No complete response within timeout ({received} bytes received)")]
    LinkTimeout { received: usize },
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// A telemetry sink refused or failed to deliver a record.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}
