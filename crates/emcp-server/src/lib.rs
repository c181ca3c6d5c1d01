//! Embeddable MCP server runtime.
//!
//! This crate links a wire transport to application tool callbacks: it
//! parses JSON-RPC 2.0 messages, walks each client through the MCP session
//! lifecycle, and dispatches `tools/call` requests to registered handlers
//! on a bounded worker pool. Replies, errors, and progress flow back
//! through the transport the client arrived on. A health monitor enforces
//! execution, idle, cancellation, and client timeouts.
//!
//! The runtime owns no sockets. A transport implements [`Transport`] per
//! client connection and calls [`McpServer::handle_request`] with raw JSON;
//! everything else happens inside.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::json;
//! use emcp_server::{
//!     McpServer, ServerConfig, ServerHandle, ToolEvent, ToolHandler, ToolMessage,
//!     ToolMetadata, ToolRecord,
//! };
//! use emcp_core::{ExecutionToken, Result};
//!
//! struct Echo {
//!     server: ServerHandle,
//! }
//!
//! #[async_trait]
//! impl ToolHandler for Echo {
//!     async fn invoke(
//!         &self,
//!         _event: ToolEvent,
//!         arguments: Option<&str>,
//!         token: ExecutionToken,
//!     ) -> Result<()> {
//!         let text = arguments.unwrap_or("{}").to_string();
//!         self.server
//!             .submit_tool_message(ToolMessage::Response { text, is_error: false }, token)
//!             .await
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let mut server = McpServer::new(ServerConfig::default())?;
//! let handle = server.handle();
//! server.add_tool(ToolRecord::new(
//!     ToolMetadata::new("echo", json!({"type": "object"})),
//!     Arc::new(Echo { server: handle }),
//! ))?;
//! server.start()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod client;
mod codec;
mod config;
mod dispatch;
mod execution;
mod health;
mod server;
mod tool;
mod transport;
mod worker;

pub use codec::{
    serialize_logging_notification, serialize_tools_list_changed_notification, Method,
    PROTOCOL_VERSION,
};
pub use config::ServerConfig;
pub use server::{McpServer, ServerHandle};
pub use tool::{ToolEvent, ToolHandler, ToolMessage, ToolMetadata, ToolRecord};
pub use transport::{Transport, TransportBinding, TransportMessage};

// Re-exported for downstream convenience; handlers and transports speak
// these types on every call.
pub use emcp_core::{Error, ExecutionToken, Result};
