//! Per-method request handlers.
//!
//! Every handler follows the same contract: validate the client's lifecycle
//! state, hold a [`ClientRef`] for the duration, never call into the
//! transport while a registry lock is held, and release everything on every
//! exit path. `initialize` is the exception — it runs inline on the
//! transport's task (a queued initialize could deadlock behind workers that
//! are all busy with calls from the uninitialised client).

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use emcp_core::{Error, Result};

use crate::client::{ClientContext, LifecycleState};
use crate::codec::{self, InitializeResult, PROTOCOL_VERSION};
use crate::server::ServerInner;
use crate::tool::ToolEvent;
use crate::transport::{TransportBinding, TransportMessage};

pub(crate) async fn send_to_binding(
    binding: &TransportBinding,
    msg_id: u32,
    json: String,
) -> Result<()> {
    binding.send(TransportMessage { msg_id, json }).await
}

pub(crate) async fn send_to_client(
    ctx: &Arc<ClientContext>,
    msg_id: u32,
    json: String,
) -> Result<()> {
    let binding = ctx
        .binding()
        .ok_or_else(|| Error::NotFound("transport binding".to_string()))?;
    send_to_binding(&binding, msg_id, json).await
}

/// Serialise and deliver a JSON-RPC error reply to `ctx`.
pub(crate) async fn send_error_reply(
    server: &ServerInner,
    ctx: &Arc<ClientContext>,
    id: Option<i64>,
    code: i32,
    message: &str,
    msg_id: u32,
) -> Result<()> {
    let json = codec::serialize_error(id, code, message, None, server.config.max_message_size)?;
    send_to_client(ctx, msg_id, json).await
}

/// Like [`send_error_reply`], for bindings that have no client yet.
pub(crate) async fn send_error_to_binding(
    server: &ServerInner,
    binding: &TransportBinding,
    id: Option<i64>,
    code: i32,
    message: &str,
    msg_id: u32,
) -> Result<()> {
    let json = codec::serialize_error(id, code, message, None, server.config.max_message_size)?;
    send_to_binding(binding, msg_id, json).await
}

/// `initialize`: allocate a session, reply with server info.
///
/// Runs inline on the transport's task. On any failure after allocation the
/// client is removed again, so a failed handshake leaves no slot behind.
pub(crate) async fn handle_initialize(
    server: &ServerInner,
    binding: &TransportBinding,
    id: i64,
    protocol_version: &str,
    msg_id: u32,
) -> Result<()> {
    if protocol_version != PROTOCOL_VERSION {
        warn!(version = %protocol_version, "protocol version mismatch");
        return Err(Error::InvalidArgument(format!(
            "unsupported protocol version '{protocol_version}'"
        )));
    }

    let ctx = server.clients.add(Arc::clone(binding))?;
    if let Err(err) = ctx.transition(LifecycleState::New, LifecycleState::Initializing) {
        server.clients.remove(&ctx);
        return Err(err);
    }
    let Some(guard) = ctx.acquire() else {
        server.clients.remove(&ctx);
        return Err(Error::Internal("freshly added client is not live".to_string()));
    };

    let result = async {
        let json = codec::serialize_initialize_result(
            id,
            &InitializeResult {
                server_name: &server.config.server_info_name,
                server_version: &server.config.server_info_version,
                capabilities: json!({"tools": {"listChanged": false}}),
            },
            server.config.max_message_size,
        )?;
        send_to_binding(binding, msg_id, json).await
    }
    .await;

    if let Err(err) = result {
        warn!(client = ctx.index(), error = %err, "initialize failed, removing client");
        server.clients.remove(&ctx);
        drop(guard);
        return Err(err);
    }

    debug!(client = ctx.index(), "client initializing");
    drop(guard);
    Ok(())
}

pub(crate) async fn handle_ping(
    server: &ServerInner,
    ctx: &Arc<ClientContext>,
    id: i64,
    msg_id: u32,
) -> Result<()> {
    let _guard = ctx.acquire_initialized()?;
    let json = codec::serialize_ping_result(id, server.config.max_message_size)?;
    send_to_client(ctx, msg_id, json).await
}

pub(crate) async fn handle_tools_list(
    server: &ServerInner,
    ctx: &Arc<ClientContext>,
    id: i64,
    msg_id: u32,
) -> Result<()> {
    let _guard = ctx.acquire_initialized()?;
    let tools = server.tools.metadata_snapshot();
    let json = codec::serialize_tools_list_result(id, &tools, server.config.max_message_size)?;
    send_to_client(ctx, msg_id, json).await
}

/// `tools/call`: admit the request, bind an execution, invoke the callback.
///
/// The reply is *not* sent here — it goes out when the callback submits its
/// final tool message. A callback error rolls back the execution record,
/// the tool's activity counter, and the client's active-request slot, in
/// that order, unless the callback already submitted its final message.
pub(crate) async fn handle_tools_call(
    server: &ServerInner,
    ctx: &Arc<ClientContext>,
    id: i64,
    name: String,
    arguments: Option<String>,
    msg_id: u32,
    worker_id: usize,
) -> Result<()> {
    let guard = ctx.begin_request(server.config.max_client_requests)?;

    let handler = match server.tools.begin_execution(&name) {
        Ok(handler) => handler,
        Err(err) => {
            ctx.end_request();
            return Err(err);
        }
    };

    let token = match server.executions.add(
        Arc::clone(ctx),
        id,
        msg_id,
        name.clone(),
        worker_id,
    ) {
        Ok(token) => token,
        Err(err) => {
            server.tools.end_execution(&name);
            ctx.end_request();
            return Err(err);
        }
    };

    debug!(tool = %name, token = %token, "invoking tool callback");
    if let Err(err) = handler
        .invoke(ToolEvent::Invoke, arguments.as_deref(), token)
        .await
    {
        warn!(tool = %name, token = %token, error = %err, "tool callback failed");
        // Only roll back if the callback did not already finish the
        // execution by submitting a final tool message.
        if server.executions.remove(token).is_some() {
            server.tools.end_execution(&name);
            ctx.end_request();
        }
        return Err(err);
    }

    drop(guard);
    Ok(())
}

/// `notifications/initialized`: Initializing → Initialized.
pub(crate) fn handle_initialized(ctx: &Arc<ClientContext>) -> Result<()> {
    let _guard = ctx
        .acquire()
        .ok_or_else(|| Error::NotFound("client".to_string()))?;
    ctx.transition(LifecycleState::Initializing, LifecycleState::Initialized)?;
    debug!(client = ctx.index(), "client initialized");
    Ok(())
}

/// `notifications/cancelled`: flip the named execution to *Cancelled*.
pub(crate) fn handle_cancelled(
    server: &ServerInner,
    ctx: &Arc<ClientContext>,
    request_id: i64,
    reason: Option<String>,
) -> Result<()> {
    let _guard = ctx
        .acquire()
        .ok_or_else(|| Error::NotFound("client".to_string()))?;
    debug!(
        client = ctx.index(),
        request_id,
        reason = reason.as_deref().unwrap_or(""),
        "client cancelled request"
    );
    server.executions.cancel_by_request_id(ctx, request_id)
}
