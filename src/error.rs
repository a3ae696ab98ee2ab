use thiserror::Error;
use wyoming_protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, WyomingError>;

/// Error type returned by handlers plugged into the server
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WyomingError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<std::io::Error> for WyomingError {
    fn from(err: std::io::Error) -> Self {
        WyomingError::Transport(err.to_string())
    }
}

impl From<ProtocolError> for WyomingError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => WyomingError::Transport(e.to_string()),
            ProtocolError::Decode(msg) => WyomingError::Decode(msg),
            ProtocolError::Encode(msg) => WyomingError::Encode(msg),
            ProtocolError::Json(e) => WyomingError::Encode(e.to_string()),
            other @ ProtocolError::UnexpectedType { .. } => WyomingError::Decode(other.to_string()),
        }
    }
}

impl From<HandlerError> for WyomingError {
    fn from(err: HandlerError) -> Self {
        WyomingError::Handler(err.to_string())
    }
}
