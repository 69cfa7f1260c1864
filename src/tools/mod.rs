//! The host side of tool calling: what a tool looks like to whoever invokes
//! it, and where tools get registered.

pub mod registry;
pub mod schema;

pub use registry::Registry;
pub use schema::{Schema, SchemaType};

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;
use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Function declaration handed to a model: a name, what it does, and the
/// shape of its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declaration {
    pub name: String,
    pub description: String,
    pub parameters: Schema,
}

/// Outcome of executing a tool. Failures are reported here rather than as
/// errors so every invocation yields the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub is_error: bool,
    pub output: String,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            is_error: false,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            output: message.into(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn declaration(&self) -> Declaration;
    async fn execute(&self, args: Value) -> ToolResult;
}

pub type ArcTool = Arc<dyn Tool>;

#[cfg_attr(test, automock)]
pub trait ToolRegistry: Send + Sync {
    fn register(&self, tool: ArcTool) -> Result<()>;
}
