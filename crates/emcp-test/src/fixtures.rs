//! Canned requests, tool handlers, and session helpers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use emcp_core::{Error, ExecutionToken, Result};
use emcp_server::{
    ServerHandle, ToolEvent, ToolHandler, ToolMessage, TransportMessage, PROTOCOL_VERSION,
};

use crate::mocks::MockTransport;

/// Install a fmt subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An `initialize` request quoting the supported protocol version.
#[must_use]
pub fn initialize_request(id: i64) -> String {
    initialize_request_with_version(id, PROTOCOL_VERSION)
}

/// An `initialize` request quoting an arbitrary protocol version.
#[must_use]
pub fn initialize_request_with_version(id: i64, version: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {"protocolVersion": version, "capabilities": {}},
    })
    .to_string()
}

/// A `notifications/initialized` notification.
#[must_use]
pub fn initialized_notification() -> String {
    json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string()
}

/// A `ping` request.
#[must_use]
pub fn ping_request(id: i64) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": "ping", "params": {}}).to_string()
}

/// A `tools/list` request.
#[must_use]
pub fn tools_list_request(id: i64) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list", "params": {}}).to_string()
}

/// A `tools/call` request.
#[must_use]
pub fn tools_call_request(id: i64, name: &str, arguments: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments},
    })
    .to_string()
}

/// A `notifications/cancelled` notification.
#[must_use]
pub fn cancelled_notification(request_id: i64, reason: Option<&str>) -> String {
    let mut params = json!({"requestId": request_id});
    if let (Some(obj), Some(reason)) = (params.as_object_mut(), reason) {
        obj.insert("reason".to_string(), json!(reason));
    }
    json!({"jsonrpc": "2.0", "method": "notifications/cancelled", "params": params}).to_string()
}

/// Drive `transport` from a fresh connection to an *Initialized* session.
///
/// Consumes the `initialize` reply and any probe replies it produced.
/// Reserves transport msg ids below 100; tests should use higher ids for
/// their own traffic.
///
/// # Panics
///
/// Panics if the handshake fails or the session never reaches the
/// *Initialized* state.
pub async fn establish_session(server: &ServerHandle, transport: &Arc<MockTransport>) {
    let binding = transport.binding();
    server
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 1,
                json: initialize_request(1),
            },
        )
        .await
        .expect("initialize should succeed");
    let reply = transport.expect_message().await;
    assert!(
        reply.json.contains("protocolVersion"),
        "unexpected initialize reply: {}",
        reply.json
    );

    server
        .handle_request(
            &binding,
            TransportMessage {
                msg_id: 2,
                json: initialized_notification(),
            },
        )
        .await
        .expect("initialized notification should be accepted");

    // The notification is applied asynchronously by a worker; probe with
    // pings until the session answers as initialized.
    for attempt in 0u32..50 {
        let msg_id = attempt.saturating_add(3);
        server
            .handle_request(
                &binding,
                TransportMessage {
                    msg_id,
                    json: ping_request(i64::from(attempt).saturating_add(9_000)),
                },
            )
            .await
            .expect("ping should be queued");
        let reply = transport.expect_message().await;
        if reply.value().get("error").is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached the initialized state");
}

/// Tool that immediately submits a fixed [`ToolMessage::Response`].
pub struct ReplyTool {
    server: ServerHandle,
    text: String,
    is_error: bool,
}

impl ReplyTool {
    /// A tool answering `text` as a success result.
    #[must_use]
    pub fn new(server: ServerHandle, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            server,
            text: text.into(),
            is_error: false,
        })
    }

    /// A tool answering `text` as a tool-level error result.
    #[must_use]
    pub fn error(server: ServerHandle, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            server,
            text: text.into(),
            is_error: true,
        })
    }
}

#[async_trait]
impl ToolHandler for ReplyTool {
    async fn invoke(
        &self,
        _event: ToolEvent,
        _arguments: Option<&str>,
        token: ExecutionToken,
    ) -> Result<()> {
        self.server
            .submit_tool_message(
                ToolMessage::Response {
                    text: self.text.clone(),
                    is_error: self.is_error,
                },
                token,
            )
            .await
    }
}

/// Tool whose callback fails without submitting anything; exercises the
/// dispatcher's rollback path.
pub struct FailingTool;

impl FailingTool {
    /// The failing tool.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ToolHandler for FailingTool {
    async fn invoke(
        &self,
        _event: ToolEvent,
        _arguments: Option<&str>,
        _token: ExecutionToken,
    ) -> Result<()> {
        Err(Error::Internal("tool callback failure".to_string()))
    }
}

/// What [`ManualTool`] saw when it was invoked.
#[derive(Debug, Clone)]
pub struct CapturedInvocation {
    /// The event the runtime delivered.
    pub event: ToolEvent,
    /// Raw arguments JSON, verbatim.
    pub arguments: Option<String>,
    /// Token for driving the execution from the test body.
    pub token: ExecutionToken,
}

/// Tool that records its invocation and returns immediately, leaving the
/// execution active for the test to drive via `submit_tool_message`.
pub struct ManualTool {
    captures: mpsc::UnboundedSender<CapturedInvocation>,
}

impl ManualTool {
    /// The tool plus the receiving end of its capture channel.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<CapturedInvocation>) {
        let (captures, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { captures }), rx)
    }
}

#[async_trait]
impl ToolHandler for ManualTool {
    async fn invoke(
        &self,
        event: ToolEvent,
        arguments: Option<&str>,
        token: ExecutionToken,
    ) -> Result<()> {
        let _ = self.captures.send(CapturedInvocation {
            event,
            arguments: arguments.map(str::to_string),
            token,
        });
        Ok(())
    }
}

/// Tool that sleeps silently (no pings) and polls for cancellation,
/// acknowledging with [`ToolMessage::CancelAck`] when it observes one.
pub struct CooperativeSleeper {
    server: ServerHandle,
    poll_interval: Duration,
}

impl CooperativeSleeper {
    /// A sleeper polling every 10 ms.
    #[must_use]
    pub fn new(server: ServerHandle) -> Arc<Self> {
        Arc::new(Self {
            server,
            poll_interval: Duration::from_millis(10),
        })
    }
}

#[async_trait]
impl ToolHandler for CooperativeSleeper {
    async fn invoke(
        &self,
        _event: ToolEvent,
        _arguments: Option<&str>,
        token: ExecutionToken,
    ) -> Result<()> {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.server.is_execution_cancelled(token) {
                Ok(true) => {
                    return self
                        .server
                        .submit_tool_message(ToolMessage::CancelAck, token)
                        .await;
                }
                Ok(false) => {}
                // The execution is gone; nothing left to acknowledge.
                Err(_) => return Ok(()),
            }
        }
    }
}
