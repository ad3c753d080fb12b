use thiserror::Error;

/// Errors produced by the Spark protocol layer.
#[derive(Debug, Error)]
pub enum SparkError {
    #[error("no live duplex connection")]
    ChannelUnavailable,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid data: {0}")]
    DataInvalid(String),

    #[error("response timeout")]
    ResponseTimeout,

    #[error("device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("event already registered: {0}")]
    DuplicateEvent(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for SparkError {
    fn from(e: serde_json::Error) -> Self {
        SparkError::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for SparkError {
    fn from(e: hex::FromHexError) -> Self {
        SparkError::DataInvalid(e.to_string())
    }
}

pub type SparkResult<T> = Result<T, SparkError>;
