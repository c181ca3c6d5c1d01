//! Server runtime configuration.
//!
//! Every sizing and timeout knob of the runtime lives here. The defaults
//! match a small embedded deployment; hosts can override individual fields
//! with the `with_*` builders or deserialize the whole struct from their
//! own configuration file.

use serde::Deserialize;

use emcp_core::{Error, Result};

/// Runtime configuration for one [`McpServer`](crate::McpServer).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Sizing hint for hosts that pool several servers. The runtime itself
    /// creates one server per [`McpServer::new`](crate::McpServer::new)
    /// call; this key exists so embedders can budget a fixed pool up front.
    pub server_count: usize,
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
    /// Maximum in-flight `tools/call` requests per client.
    pub max_client_requests: usize,
    /// Capacity of the tool registry.
    pub max_tools: usize,
    /// Number of request worker tasks draining the queue.
    pub request_workers: usize,
    /// Advisory worker stack size in bytes. Task stacks are managed by the
    /// async runtime; the key is kept for hosts that provision dedicated
    /// worker threads instead.
    pub request_worker_stack_size: usize,
    /// Maximum accepted tool name length in bytes.
    pub tool_name_max_len: usize,
    /// Maximum accepted raw length of the `tools/call` `arguments` object.
    pub tool_input_args_max_len: usize,
    /// Maximum size of one serialized JSON-RPC message, inbound or
    /// outbound.
    pub max_message_size: usize,
    /// Total wall-clock budget for one tool execution before the health
    /// monitor cancels it.
    pub tool_exec_timeout_ms: u64,
    /// Maximum silence (no ping, no response) from a tool callback before
    /// the health monitor cancels the execution.
    pub tool_idle_timeout_ms: u64,
    /// Grace period for a cancelled callback to acknowledge before the
    /// health monitor logs it as misbehaving.
    pub tool_cancel_timeout_ms: u64,
    /// Maximum client silence before the session is removed.
    pub client_timeout_ms: u64,
    /// Interval between health monitor sweeps.
    pub health_check_interval_ms: u64,
    /// Whether to run the health monitor at all.
    pub health_monitor: bool,
    /// Server name reported in the `initialize` reply.
    pub server_info_name: String,
    /// Server version reported in the `initialize` reply.
    pub server_info_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_count: 1,
            max_clients: 4,
            max_client_requests: 2,
            max_tools: 8,
            request_workers: 2,
            request_worker_stack_size: 4096,
            tool_name_max_len: 32,
            tool_input_args_max_len: 512,
            max_message_size: 1024,
            tool_exec_timeout_ms: 30_000,
            tool_idle_timeout_ms: 5_000,
            tool_cancel_timeout_ms: 5_000,
            client_timeout_ms: 60_000,
            health_check_interval_ms: 1_000,
            health_monitor: true,
            server_info_name: "emcp".to_string(),
            server_info_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Set the server name and version reported to clients.
    #[must_use]
    pub fn with_server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info_name = name.into();
        self.server_info_version = version.into();
        self
    }

    /// Set the per-client concurrent request cap.
    #[must_use]
    pub fn with_max_client_requests(mut self, max: usize) -> Self {
        self.max_client_requests = max;
        self
    }

    /// Set the number of request workers.
    #[must_use]
    pub fn with_request_workers(mut self, workers: usize) -> Self {
        self.request_workers = workers;
        self
    }

    /// Set the execution, idle, and cancel timeouts in one go.
    #[must_use]
    pub fn with_tool_timeouts_ms(mut self, exec: u64, idle: u64, cancel: u64) -> Self {
        self.tool_exec_timeout_ms = exec;
        self.tool_idle_timeout_ms = idle;
        self.tool_cancel_timeout_ms = cancel;
        self
    }

    /// Set the health monitor sweep interval.
    #[must_use]
    pub fn with_health_check_interval_ms(mut self, interval: u64) -> Self {
        self.health_check_interval_ms = interval;
        self
    }

    /// Disable the health monitor task.
    #[must_use]
    pub fn without_health_monitor(mut self) -> Self {
        self.health_monitor = false;
        self
    }

    /// Capacity of the request queue and the execution registry.
    #[must_use]
    pub(crate) fn max_requests(&self) -> usize {
        self.max_clients.saturating_mul(self.max_client_requests)
    }

    /// Validate that every sizing knob is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_clients", self.max_clients),
            ("max_client_requests", self.max_client_requests),
            ("max_tools", self.max_tools),
            ("request_workers", self.request_workers),
            ("tool_name_max_len", self.tool_name_max_len),
            ("tool_input_args_max_len", self.tool_input_args_max_len),
            ("max_message_size", self.max_message_size),
            ("health_check_interval_ms", usize::try_from(self.health_check_interval_ms).unwrap_or(usize::MAX)),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::InvalidArgument(format!("{name} must be nonzero")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_requests(), 8);
    }

    #[test]
    fn zero_sized_registry_is_rejected() {
        let config = ServerConfig {
            max_tools: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"max_clients": 2, "request_workers": 1}"#).unwrap();
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.request_workers, 1);
        assert_eq!(config.max_tools, 8);
    }

    #[test]
    fn builders_override_fields() {
        let config = ServerConfig::default()
            .with_server_info("unit", "9.9.9")
            .with_tool_timeouts_ms(100, 20, 20)
            .without_health_monitor();
        assert_eq!(config.server_info_name, "unit");
        assert_eq!(config.tool_idle_timeout_ms, 20);
        assert!(!config.health_monitor);
    }
}
