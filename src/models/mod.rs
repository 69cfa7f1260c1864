pub mod mcp;
pub mod message;

pub use mcp::*;
pub use message::{JSONRPC_VERSION, Message, RpcError};
