use thiserror::Error;

/// Why an upgrade request was refused. Each variant maps to the HTTP status
/// written back before the socket is closed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("connection closed before handshake completed")]
    Eof,
    #[error("timed out waiting for handshake")]
    Timeout,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("no bridge mounted at {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("handshake io: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Status line to answer with, or `None` when the peer is already gone.
    pub fn status(&self) -> Option<&'static str> {
        match self {
            HandshakeError::TooLarge { .. } => Some("431 Request Header Fields Too Large"),
            HandshakeError::Malformed(_) => Some("400 Bad Request"),
            HandshakeError::NotFound(_) => Some("404 Not Found"),
            HandshakeError::Unauthorized(_) => Some("401 Unauthorized"),
            HandshakeError::Timeout => Some("408 Request Timeout"),
            HandshakeError::Eof | HandshakeError::Io(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key {0:?}")]
    InvalidKey(String),
    #[error("store io for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store record {key} is not valid json: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
