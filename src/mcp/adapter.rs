#[cfg(test)]
#[path = "adapter_test.rs"]
mod tests;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    config::constants::TOOL_NAME_SEPARATOR,
    models::{CallToolResultContent, Tool as ToolDescriptor},
    tools::{Declaration, Schema, Tool, ToolResult},
};

use super::ArcMCP;

/// Exposes one remote tool through the local [`Tool`] contract.
pub struct McpToolAdapter {
    qualified_name: String,
    server: String,
    description: String,
    descriptor: ToolDescriptor,
    client: ArcMCP,
}

impl McpToolAdapter {
    pub fn new(server: &str, descriptor: ToolDescriptor, client: ArcMCP) -> Self {
        let description = match descriptor.description.as_deref() {
            Some(d) if !d.trim().is_empty() => d.to_string(),
            _ => format!("tool from {}", server),
        };
        Self {
            qualified_name: format!("{}{}{}", server, TOOL_NAME_SEPARATOR, descriptor.name),
            server: server.to_string(),
            description,
            descriptor,
            client,
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Name of the tool on its own server.
    pub fn remote_name(&self) -> &str {
        &self.descriptor.name
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn declaration(&self) -> Declaration {
        Declaration {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            parameters: Schema::from(&self.descriptor.input_schema),
        }
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let result = match self.client.call_tool(&self.descriptor.name, args).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("[{}] calling {}: {}", self.server, self.descriptor.name, err);
                return ToolResult::error(err.to_string());
            }
        };

        if result.is_error {
            return ToolResult::error(result.text());
        }

        let output = result
            .content
            .iter()
            .filter_map(|content| match content {
                CallToolResultContent::Text { text } => Some(text.clone()),
                CallToolResultContent::Image { mime_type, .. } => {
                    Some(format!("[image: {}]", mime_type))
                }
                CallToolResultContent::Resource { resource } => Some(
                    resource
                        .text
                        .clone()
                        .unwrap_or_else(|| format!("[resource: {}]", resource.uri)),
                ),
                CallToolResultContent::Unknown => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        ToolResult::success(output)
    }
}
