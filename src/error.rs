use thiserror::Error;

/// Crate-wide error type for the stream orchestration core.
///
/// Variants follow the taxonomy in the design docs: each maps to exactly one
/// component family so callers can match on the kind of failure rather than
/// parsing messages.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("config schema violation: {0}")]
    ConfigSchema(String),

    #[error("config persistence error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device probe failed [{device}]: {reason}")]
    DeviceProbeFailed { device: String, reason: String },

    #[error("signal lost on device {0}")]
    SignalLost(String),

    #[error("no working encoder for codec {0}")]
    NoWorkingEncoder(String),

    #[error("failed to spawn encoder for stream {stream_id}: {reason}")]
    SpawnFailed { stream_id: String, reason: String },

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("malformed rtp payload: {0}")]
    MalformedRtp(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store format error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("store format error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
