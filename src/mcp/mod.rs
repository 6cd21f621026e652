//! MCP (Model Context Protocol) tool-call surface, served over HTTP by
//! `bin/server.rs` (§10.5).

pub mod protocol;
pub mod tools;

pub use protocol::{methods, InitializeResult, McpHandler, McpRequest, McpResponse, ToolCallResult};
pub use tools::get_tool_definitions;
