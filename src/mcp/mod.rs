pub mod adapter;
pub mod client;
pub mod error;
pub mod manager;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::McpToolAdapter;
pub use client::Client;
pub use error::McpError;
pub use manager::{ConnectError, ConnectFailure, Connector, Manager, ServerState, ServerStatus};
pub use transport::{ArcTransport, Transport};

#[cfg(test)]
use mockall::automock;

use crate::models::{CallToolResult, Tool};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MCP: Send + Sync + 'static {
    async fn list_tools(&self) -> Result<Vec<Tool>, McpError>;
    async fn call_tool(&self, tool: &str, args: Value) -> Result<CallToolResult, McpError>;
    async fn ping(&self) -> Result<(), McpError>;
    async fn close(&self) -> Result<(), McpError>;
}

pub type ArcMCP = Arc<dyn MCP>;
