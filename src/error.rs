//! Error types for the stream client.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Bayeux status code the server uses to reject an out-of-range replay id.
const REPLAY_REJECTION_CODE: u16 = 400;

/// Main error type for client operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport could not re-establish the connection within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by the server")]
    ConnectionClosed,

    #[error("Server error: {0}")]
    Server(ServerError),

    #[error("Replay rejected for channel {channel}: {source}")]
    Replay { channel: String, source: ServerError },

    #[error("Replay marker extraction failed: {0}")]
    ReplayExtraction(String),

    #[error("Marker storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Marker storage is locked by another process")]
    Locked,

    #[error("Client is closed")]
    ClientClosed,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Coarse grouping of [`StreamError`] variants for programmatic handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Transport,
    Server,
    Replay,
    Storage,
    Client,
}

impl StreamError {
    /// The kind of failure, for callers that branch on category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::Authentication(_) => ErrorKind::Authentication,
            StreamError::Transport(_) | StreamError::Timeout(_) | StreamError::ConnectionClosed => {
                ErrorKind::Transport
            }
            StreamError::Server(_) => ErrorKind::Server,
            StreamError::Replay { .. } | StreamError::ReplayExtraction(_) => ErrorKind::Replay,
            StreamError::Storage(_)
            | StreamError::Io(_)
            | StreamError::Serialization(_)
            | StreamError::Deserialization(_)
            | StreamError::Corruption(_)
            | StreamError::Locked => ErrorKind::Storage,
            StreamError::ClientClosed | StreamError::InvalidOperation(_) => ErrorKind::Client,
        }
    }

    /// Whether the client can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Authentication(_)
                | StreamError::Timeout(_)
                | StreamError::ConnectionClosed
                | StreamError::ClientClosed
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StreamError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

/// A rejection reported by the streaming server.
///
/// Bayeux servers report errors as `"<code>:<arg1,arg2>:<message>"`; both
/// the code and the arguments are optional.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    pub code: Option<u16>,
    pub args: Vec<String>,
    pub message: String,
}

impl ServerError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            args: Vec::new(),
            message: message.into(),
        }
    }

    /// Parse a Bayeux error string.
    ///
    /// Strings that don't follow the `code:args:message` layout are kept
    /// whole as the message.
    pub fn parse(error: &str) -> Self {
        let mut parts = error.splitn(3, ':');
        if let (Some(code), Some(args), Some(message)) = (parts.next(), parts.next(), parts.next())
        {
            if let Ok(code) = code.trim().parse::<u16>() {
                let args = args
                    .split(',')
                    .filter(|arg| !arg.is_empty())
                    .map(str::to_string)
                    .collect();
                return Self {
                    code: Some(code),
                    args,
                    message: message.to_string(),
                };
            }
        }

        Self {
            code: None,
            args: Vec::new(),
            message: error.to_string(),
        }
    }

    /// Whether the server rejected the replay position of a subscribe request.
    pub fn is_replay_rejection(&self) -> bool {
        self.code == Some(REPLAY_REJECTION_CODE)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}:{}:{}", code, self.args.join(","), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ServerError {}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, StreamError>;
