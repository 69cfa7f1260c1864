pub mod http;
pub mod stdio;

pub use http::Http;
pub use stdio::Stdio;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    config::{ServerConfig, TransportKind},
    models::Message,
};

use super::McpError;

/// Ordered message channel to one MCP server.
///
/// `send` and `receive` may run concurrently: the client keeps one task
/// blocked in `receive` while callers send requests. After `close` both fail.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serializes and writes one message.
    async fn send(&self, message: &Message) -> Result<(), McpError>;

    /// Waits for the next complete message.
    async fn receive(&self) -> Result<Message, McpError>;

    /// Releases the underlying process or connection. Idempotent.
    async fn close(&self) -> Result<(), McpError>;
}

pub type ArcTransport = Arc<dyn Transport>;

/// Builds the transport described by `config`.
pub fn open(kind: TransportKind, config: &ServerConfig) -> Result<ArcTransport, McpError> {
    let transport: ArcTransport = match kind {
        TransportKind::Stdio => Arc::new(Stdio::new(config)?),
        TransportKind::Http => Arc::new(Http::new(config)?),
    };
    Ok(transport)
}
