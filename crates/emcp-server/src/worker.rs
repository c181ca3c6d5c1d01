//! Request worker pool.
//!
//! A fixed number of workers drain one bounded queue. Each queue entry
//! carries a [`ClientRef`] taken when the message was enqueued; the worker
//! drops it after dispatch, which is the `put` that may release the slot.
//!
//! Error kinds map to JSON-RPC codes here and nowhere else. Notifications
//! never produce replies; their failures are logged and dropped.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use emcp_core::Error;

use crate::client::ClientRef;
use crate::codec::Message;
use crate::dispatch;
use crate::server::ServerInner;

/// One entry in the request queue. Ownership of the parsed message and one
/// client reference transfers from the transport task to the worker.
pub(crate) struct QueueMsg {
    pub(crate) client: ClientRef,
    pub(crate) transport_msg_id: u32,
    pub(crate) message: Message,
}

/// Deterministic error → JSON-RPC mapping, applied once at the edge.
pub(crate) fn jsonrpc_error_parts(err: &Error) -> (i32, &'static str) {
    match err {
        Error::NotFound(_) => (-32601, "Resource not found"),
        Error::PermissionDenied(_) => (-32602, "Permission denied"),
        Error::NoSpace(_) => (-32603, "Resource exhausted"),
        Error::NoMemory => (-32603, "Memory allocation failed"),
        Error::AccessDenied => (-32602, "Client not initialized"),
        Error::Busy(_) => (-32002, "Client is busy"),
        Error::MethodNotFound(_) => (-32601, "Method not found"),
        Error::InvalidRequest(_) => (-32600, "Invalid request"),
        Error::InvalidArgument(_) => (-32602, "Invalid params"),
        Error::AlreadyExists(_)
        | Error::OutOfSpace { .. }
        | Error::Transport(_)
        | Error::Internal(_) => (-32603, "Internal server error"),
    }
}

pub(crate) async fn run(
    server: Arc<ServerInner>,
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<QueueMsg>>>,
) {
    info!(worker = worker_id, "request worker started");
    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(msg) = next else {
            debug!(worker = worker_id, "request queue closed, worker exiting");
            return;
        };
        process(&server, worker_id, msg).await;
    }
}

async fn process(server: &Arc<ServerInner>, worker_id: usize, msg: QueueMsg) {
    let QueueMsg {
        client,
        transport_msg_id,
        message,
    } = msg;
    let ctx = Arc::clone(client.context());
    let is_notification = message.is_notification();
    let request_id = message.request_id();

    let result = match message {
        Message::Ping { id } => dispatch::handle_ping(server, &ctx, id, transport_msg_id).await,
        Message::ToolsList { id } => {
            dispatch::handle_tools_list(server, &ctx, id, transport_msg_id).await
        }
        Message::ToolsCall {
            id,
            name,
            arguments,
        } => {
            dispatch::handle_tools_call(
                server,
                &ctx,
                id,
                name,
                arguments,
                transport_msg_id,
                worker_id,
            )
            .await
        }
        Message::Initialized => dispatch::handle_initialized(&ctx),
        Message::Cancelled { request_id, reason } => {
            dispatch::handle_cancelled(server, &ctx, request_id, reason)
        }
        // Initialize and unknown methods are answered inline in
        // handle_request and never enqueued.
        Message::Initialize { .. } | Message::Unknown { .. } => {
            debug!(worker = worker_id, "inline-only message reached the queue");
            Ok(())
        }
    };

    if let Err(err) = result {
        if is_notification {
            debug!(worker = worker_id, error = %err, "notification handler failed");
        } else {
            let (code, text) = jsonrpc_error_parts(&err);
            warn!(worker = worker_id, code, error = %err, "request failed");
            if let Err(send_err) =
                dispatch::send_error_reply(server, &ctx, request_id, code, text, transport_msg_id)
                    .await
            {
                warn!(worker = worker_id, error = %send_err, "failed to deliver error reply");
            }
        }
    }

    // Release the reference taken when the message was queued.
    drop(client);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_is_deterministic() {
        let cases = [
            (Error::NotFound("x".into()), -32601, "Resource not found"),
            (
                Error::PermissionDenied("x".into()),
                -32602,
                "Permission denied",
            ),
            (Error::NoSpace("tool"), -32603, "Resource exhausted"),
            (Error::NoMemory, -32603, "Memory allocation failed"),
            (Error::AccessDenied, -32602, "Client not initialized"),
            (Error::Busy("x".into()), -32002, "Client is busy"),
            (
                Error::MethodNotFound("x".into()),
                -32601,
                "Method not found",
            ),
            (
                Error::Internal("x".into()),
                -32603,
                "Internal server error",
            ),
        ];
        for (err, code, message) in cases {
            assert_eq!(jsonrpc_error_parts(&err), (code, message));
        }
    }
}
