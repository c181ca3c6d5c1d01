//! Server aggregate and public API surface.
//!
//! [`McpServer`] owns the registries, the request queue, and the spawned
//! tasks (workers, disconnect reaper, health monitor). Transports feed it
//! through [`handle_request`](McpServer::handle_request); tool callbacks
//! answer through [`submit_tool_message`](McpServer::submit_tool_message).
//! [`ServerHandle`] is the cheap clone handed to both sides.
//!
//! Lock order, where locks nest at all: client registry → tool registry →
//! execution registry. Handlers release every lock before touching the
//! transport or awaiting a callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use emcp_core::{Error, ExecutionToken, Result};

use crate::client::ClientRegistry;
use crate::codec::{self, Message, Method};
use crate::config::ServerConfig;
use crate::dispatch;
use crate::execution::{ExecutionRegistry, ExecutionState};
use crate::health;
use crate::tool::{ToolMessage, ToolRecord, ToolRegistry};
use crate::transport::{TransportBinding, TransportMessage};
use crate::worker::{self, QueueMsg};

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) clients: ClientRegistry,
    pub(crate) tools: ToolRegistry,
    pub(crate) executions: ExecutionRegistry,
    queue_tx: mpsc::Sender<QueueMsg>,
    queue_rx: StdMutex<Option<mpsc::Receiver<QueueMsg>>>,
    reaper_rx: StdMutex<Option<mpsc::UnboundedReceiver<TransportBinding>>>,
    started: AtomicBool,
}

enum SubmitAction {
    KeepAlive,
    IgnoredAfterCancel,
    FinishSilently,
    FinishDropped,
    InvalidCancelAck,
    Reply {
        request_id: i64,
        transport_msg_id: u32,
        binding: Option<TransportBinding>,
        text: String,
        is_error: bool,
    },
}

impl ServerInner {
    async fn handle_request(
        &self,
        binding: &TransportBinding,
        request: TransportMessage,
    ) -> Result<Method> {
        let message = match codec::parse_message(&request.json, &self.config) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "failed to parse inbound message");
                // Answer malformed input immediately so the client sees a
                // JSON-RPC error even without a session.
                let (code, text) = worker::jsonrpc_error_parts(&err);
                if let Err(send_err) = dispatch::send_error_to_binding(
                    self,
                    binding,
                    None,
                    code,
                    text,
                    request.msg_id,
                )
                .await
                {
                    debug!(error = %send_err, "failed to deliver parse error reply");
                }
                return Err(err);
            }
        };

        let method = message.method();
        match message {
            // Handled inline: queueing initialize could deadlock behind
            // workers busy with calls from the uninitialised client.
            Message::Initialize {
                id,
                protocol_version,
            } => {
                if let Err(err) = dispatch::handle_initialize(
                    self,
                    binding,
                    id,
                    &protocol_version,
                    request.msg_id,
                )
                .await
                {
                    let (code, text) = worker::jsonrpc_error_parts(&err);
                    if let Err(send_err) = dispatch::send_error_to_binding(
                        self,
                        binding,
                        Some(id),
                        code,
                        text,
                        request.msg_id,
                    )
                    .await
                    {
                        debug!(error = %send_err, "failed to deliver initialize error reply");
                    }
                    return Err(err);
                }
            }
            // Also inline: the error reply needs no worker round-trip.
            Message::Unknown { id } => {
                let guard = self.clients.get_by_binding(binding).ok_or_else(|| {
                    Error::NotFound("client for transport binding".to_string())
                })?;
                guard.context().touch();
                warn!(client = guard.context().index(), "unknown method requested");
                let (code, text) =
                    worker::jsonrpc_error_parts(&Error::MethodNotFound(String::new()));
                let result = dispatch::send_error_reply(
                    self,
                    guard.context(),
                    id,
                    code,
                    text,
                    request.msg_id,
                )
                .await;
                drop(guard);
                result?;
            }
            queued => {
                let guard = self.clients.get_by_binding(binding).ok_or_else(|| {
                    Error::NotFound("client for transport binding".to_string())
                })?;
                guard.context().touch();
                let msg = QueueMsg {
                    client: guard,
                    transport_msg_id: request.msg_id,
                    message: queued,
                };
                // Ownership of the message and the client reference
                // transfers to the queue; on overflow both drop here.
                self.queue_tx.try_send(msg).map_err(|err| match err {
                    mpsc::error::TrySendError::Full(_) => Error::NoMemory,
                    mpsc::error::TrySendError::Closed(_) => {
                        Error::Internal("request queue closed".to_string())
                    }
                })?;
            }
        }
        Ok(method)
    }

    async fn submit_tool_message(
        &self,
        message: ToolMessage,
        token: ExecutionToken,
    ) -> Result<()> {
        let action = self.executions.with(token, |exec| {
            match (exec.state, message) {
                (ExecutionState::Cancelled, ToolMessage::CancelAck) => {
                    exec.state = ExecutionState::Finished;
                    SubmitAction::FinishSilently
                }
                (ExecutionState::Cancelled, ToolMessage::Response { .. }) => {
                    exec.state = ExecutionState::Finished;
                    SubmitAction::FinishDropped
                }
                (ExecutionState::Cancelled, ToolMessage::Ping) => SubmitAction::IgnoredAfterCancel,
                (_, ToolMessage::Ping) => {
                    exec.last_message = Instant::now();
                    SubmitAction::KeepAlive
                }
                (_, ToolMessage::Response { text, is_error }) => {
                    exec.last_message = Instant::now();
                    exec.state = ExecutionState::Finished;
                    SubmitAction::Reply {
                        request_id: exec.request_id,
                        transport_msg_id: exec.transport_msg_id,
                        binding: exec.client.binding(),
                        text,
                        is_error,
                    }
                }
                (_, ToolMessage::CancelAck) => SubmitAction::InvalidCancelAck,
            }
        })?;

        match action {
            SubmitAction::KeepAlive | SubmitAction::IgnoredAfterCancel => Ok(()),
            SubmitAction::FinishSilently => {
                self.finish_execution(token);
                Ok(())
            }
            SubmitAction::FinishDropped => {
                warn!(token = %token, "execution cancelled, dropping tool response");
                self.finish_execution(token);
                Ok(())
            }
            SubmitAction::InvalidCancelAck => Err(Error::InvalidArgument(
                "cancel acknowledgement for an execution that was not cancelled".to_string(),
            )),
            SubmitAction::Reply {
                request_id,
                transport_msg_id,
                binding,
                text,
                is_error,
            } => {
                let send_result = match binding {
                    None => Err(Error::NotFound("transport binding".to_string())),
                    Some(binding) => {
                        match codec::serialize_tools_call_result(
                            request_id,
                            &text,
                            is_error,
                            self.config.max_message_size,
                        ) {
                            Ok(json) => {
                                binding
                                    .send(TransportMessage {
                                        msg_id: transport_msg_id,
                                        json,
                                    })
                                    .await
                            }
                            Err(err) => Err(err),
                        }
                    }
                };
                // The registry decrements happen regardless: a lost reply
                // must not leak the execution slot or the counters.
                self.finish_execution(token);
                if let Err(err) = &send_result {
                    warn!(token = %token, error = %err, "failed to send tool response");
                }
                send_result
            }
        }
    }

    /// Final-message cleanup: release the execution slot, the client's
    /// active-request slot, and the tool's activity counter.
    fn finish_execution(&self, token: ExecutionToken) {
        if let Some(exec) = self.executions.remove(token) {
            exec.client.end_request();
            self.tools.end_execution(&exec.tool_name);
        }
    }

    fn add_tool(&self, record: ToolRecord) -> Result<()> {
        let name = record.metadata().name.clone();
        self.tools.add(record, self.config.tool_name_max_len)?;
        info!(tool = %name, "tool registered");
        Ok(())
    }

    fn remove_tool(&self, name: &str) -> Result<()> {
        self.tools.remove(name)?;
        info!(tool = %name, "tool removed");
        Ok(())
    }
}

async fn reap_disconnects(mut rx: mpsc::UnboundedReceiver<TransportBinding>) {
    while let Some(binding) = rx.recv().await {
        if let Err(err) = binding.disconnect().await {
            warn!(error = %err, "transport disconnect failed");
        }
    }
}

/// An embeddable MCP server.
///
/// Create with [`new`](Self::new), register tools, then [`start`](Self::start)
/// from within a tokio runtime. The server runs until dropped or
/// [`shutdown`](Self::shutdown).
pub struct McpServer {
    inner: Arc<ServerInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl McpServer {
    /// Initialise a server with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the configuration fails
    /// validation.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let capacity = config.max_requests();
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ServerInner {
            clients: ClientRegistry::new(config.max_clients, reaper_tx),
            tools: ToolRegistry::new(config.max_tools),
            executions: ExecutionRegistry::new(capacity),
            queue_tx,
            queue_rx: StdMutex::new(Some(queue_rx)),
            reaper_rx: StdMutex::new(Some(reaper_rx)),
            started: AtomicBool::new(false),
            config,
        });
        info!("MCP server initialized");
        Ok(Self {
            inner,
            tasks: Vec::new(),
        })
    }

    /// Spawn the request workers, the disconnect reaper, and (unless
    /// disabled) the health monitor. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the server was already started.
    pub fn start(&mut self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgument("server already started".to_string()));
        }
        let queue_rx = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Internal("request queue receiver missing".to_string()))?;
        let reaper_rx = self
            .inner
            .reaper_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Internal("disconnect reaper receiver missing".to_string()))?;

        let queue = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker_id in 0..self.inner.config.request_workers {
            self.tasks.push(tokio::spawn(worker::run(
                Arc::clone(&self.inner),
                worker_id,
                Arc::clone(&queue),
            )));
        }
        self.tasks.push(tokio::spawn(reap_disconnects(reaper_rx)));
        if self.inner.config.health_monitor {
            self.tasks
                .push(tokio::spawn(health::run(Arc::clone(&self.inner))));
        }

        info!(
            workers = self.inner.config.request_workers,
            health_monitor = self.inner.config.health_monitor,
            "MCP server started"
        );
        Ok(())
    }

    /// Stop every task spawned by [`start`](Self::start). In-flight
    /// executions are abandoned; transports keep their bindings.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("MCP server stopped");
    }

    /// A cheap, cloneable handle for transports and tool callbacks.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Entry point for transports: parse, dispatch or enqueue one inbound
    /// message. Returns the detected method for the transport's
    /// bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns the dispatch error; where a JSON-RPC error reply applies it
    /// has already been sent.
    pub async fn handle_request(
        &self,
        binding: &TransportBinding,
        request: TransportMessage,
    ) -> Result<Method> {
        self.inner.handle_request(binding, request).await
    }

    /// Register a tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] for duplicate names,
    /// [`Error::NoSpace`] when the registry is full, and
    /// [`Error::InvalidArgument`] for unusable metadata.
    pub fn add_tool(&self, record: ToolRecord) -> Result<()> {
        self.inner.add_tool(record)
    }

    /// Remove a tool by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no such tool exists and
    /// [`Error::Busy`] while executions reference it.
    pub fn remove_tool(&self, name: &str) -> Result<()> {
        self.inner.remove_tool(name)
    }

    /// Submit a tool message for the execution identified by `token`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown tokens and the transport
    /// error if the final reply could not be delivered (the execution is
    /// cleaned up regardless).
    pub async fn submit_tool_message(
        &self,
        message: ToolMessage,
        token: ExecutionToken,
    ) -> Result<()> {
        self.inner.submit_tool_message(message, token).await
    }

    /// Whether the execution identified by `token` has been cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] once the execution has finished.
    pub fn is_execution_cancelled(&self, token: ExecutionToken) -> Result<bool> {
        self.inner.executions.is_cancelled(token)
    }

}

impl Drop for McpServer {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Cheap clone of the server's API surface, minus lifecycle control.
///
/// Hand one to each transport (for `handle_request`) and move one into tool
/// handlers (for `submit_tool_message` / `is_execution_cancelled`).
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl ServerHandle {
    /// See [`McpServer::handle_request`].
    ///
    /// # Errors
    ///
    /// As for [`McpServer::handle_request`].
    pub async fn handle_request(
        &self,
        binding: &TransportBinding,
        request: TransportMessage,
    ) -> Result<Method> {
        self.inner.handle_request(binding, request).await
    }

    /// See [`McpServer::add_tool`].
    ///
    /// # Errors
    ///
    /// As for [`McpServer::add_tool`].
    pub fn add_tool(&self, record: ToolRecord) -> Result<()> {
        self.inner.add_tool(record)
    }

    /// See [`McpServer::remove_tool`].
    ///
    /// # Errors
    ///
    /// As for [`McpServer::remove_tool`].
    pub fn remove_tool(&self, name: &str) -> Result<()> {
        self.inner.remove_tool(name)
    }

    /// See [`McpServer::submit_tool_message`].
    ///
    /// # Errors
    ///
    /// As for [`McpServer::submit_tool_message`].
    pub async fn submit_tool_message(
        &self,
        message: ToolMessage,
        token: ExecutionToken,
    ) -> Result<()> {
        self.inner.submit_tool_message(message, token).await
    }

    /// See [`McpServer::is_execution_cancelled`].
    ///
    /// # Errors
    ///
    /// As for [`McpServer::is_execution_cancelled`].
    pub fn is_execution_cancelled(&self, token: ExecutionToken) -> Result<bool> {
        self.inner.executions.is_cancelled(token)
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_is_single_shot() {
        let mut server = McpServer::new(ServerConfig::default()).unwrap();
        server.start().unwrap();
        assert!(matches!(
            server.start(),
            Err(Error::InvalidArgument(_))
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn submit_with_unknown_token_fails() {
        let server = McpServer::new(ServerConfig::default()).unwrap();
        let token = ExecutionToken::new(99).unwrap();
        assert!(matches!(
            server.submit_tool_message(ToolMessage::Ping, token).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            server.is_execution_cancelled(token),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ServerConfig {
            request_workers: 0,
            ..ServerConfig::default()
        };
        assert!(McpServer::new(config).is_err());
    }
}
