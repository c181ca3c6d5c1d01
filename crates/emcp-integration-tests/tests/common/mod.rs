//! Shared harness for the end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use emcp_server::{McpServer, ServerConfig, ServerHandle};
use emcp_test::{establish_session, init_tracing, MockTransport};

/// A started server plus the cheap handle tests hand to transports and
/// tools. Dropping the harness aborts the spawned tasks.
#[allow(dead_code)]
pub struct ServerHarness {
    pub server: McpServer,
    pub handle: ServerHandle,
}

#[allow(dead_code)]
impl ServerHarness {
    /// Start a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Start a server with a custom configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        init_tracing();
        let mut server = McpServer::new(config).expect("server config is valid");
        server.start().expect("server starts");
        let handle = server.handle();
        Self { server, handle }
    }

    /// A fresh mock connection driven to the *Initialized* state.
    pub async fn connected_client(&self) -> Arc<MockTransport> {
        let transport = MockTransport::new();
        establish_session(&self.handle, &transport).await;
        transport
    }
}

/// Retry `op` until it returns true or ~2 seconds elapse.
#[allow(dead_code)]
pub async fn eventually(mut op: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if op() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
