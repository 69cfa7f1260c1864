/// MCP protocol revision sent in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Ceiling for a single request/response round trip
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

pub const LOG_LEVEL: &str = "info";

pub const HTTP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// Separator between the server name and the tool name in a qualified tool name
pub const TOOL_NAME_SEPARATOR: char = ':';
