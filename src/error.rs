use thiserror::Error;

/// Journey tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Tracking already running")]
    AlreadyRunning,

    #[error("Tracking not running")]
    NotRunning,

    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed journey record: {0}")]
    MalformedRecord(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: expected {expected:03}, got {got}")]
    Protocol { expected: u16, got: String },
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(e: serde_json::Error) -> Self {
        TrackerError::InvalidParameters(e.to_string())
    }
}
