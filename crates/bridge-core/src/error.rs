use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("companion unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("response timed out after {0}ms")]
    ResponseTimeout(u64),

    #[error("session is busy with a previous request")]
    SessionBusy,

    #[error("companion disconnected mid-request")]
    UpstreamDisconnected,

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
