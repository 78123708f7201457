use crate::expr::ExprError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Detect rule error in segment '{segment}': {source}")]
    DetectRule { segment: String, source: ExprError },

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Mirror error: {0}")]
    Mirror(#[from] redis::RedisError),

    #[error("Mirror scan timed out")]
    MirrorScanTimeout,

    #[error("Cache reload already in progress")]
    ReloadInProgress,
}

pub type Result<T> = std::result::Result<T, Error>;
