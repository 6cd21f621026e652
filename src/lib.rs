//! memory-mcp - a memory storage and retrieval service exposed over MCP
//!
//! Stores free-text memories with dense vector embeddings, retrieves them by
//! semantic similarity and structured filters, and exposes the operations as
//! MCP tool calls with bundled OAuth and API-key authorization.

pub mod auth;
pub mod config;
pub mod embedding;
pub mod encryption;
pub mod error;
pub mod mcp;
pub mod storage;
pub mod tools;
pub mod trending;
pub mod types;

pub use config::Config;
pub use error::{MemoryError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
