use std::time::Duration;
use thiserror::Error;

use crate::models::RpcError;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transport: {0}")]
    Transport(String),

    /// The peer went away: end of stream or a broken channel.
    #[error("connection closed by peer")]
    Disconnected,

    /// Local side already closed.
    #[error("connection is closed")]
    Closed,

    #[error("encoding message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decoding {method} result: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server returned {0}")]
    Rpc(#[from] RpcError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("handshake failed: {0}")]
    Handshake(#[source] Box<McpError>),

    #[error("unsupported transport {0}")]
    UnsupportedTransport(String),

    #[error("invalid server config: {0}")]
    InvalidConfig(String),

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("server {0} is not connected")]
    NotConnected(String),
}

impl McpError {
    /// Transport failures leave the client unusable; it has to be closed and
    /// reconnected.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::Io(_)
                | McpError::Http(_)
                | McpError::Transport(_)
                | McpError::Disconnected
                | McpError::Closed
        )
    }

    /// Protocol failures leave the client usable.
    pub fn is_protocol(&self) -> bool {
        matches!(self, McpError::Rpc(_) | McpError::Decode { .. })
    }
}
