//! Transport binding contract.
//!
//! The runtime never opens a socket or parses a frame itself. A transport
//! implementation (HTTP/SSE, stdio, an in-memory mock) owns the client
//! channel and supplies a [`Transport`] object per connected client — the
//! *binding*. The runtime routes replies through [`Transport::send`] and
//! tears the channel down through [`Transport::disconnect`] when the last
//! reference to the client drops.

use async_trait::async_trait;
use std::sync::Arc;

use emcp_core::Result;

/// One framed JSON payload exchanged with a transport binding.
///
/// `msg_id` is an opaque correlation id owned by the transport; the runtime
/// quotes it back so the transport can route the reply chunk. The runtime
/// hands over ownership of `json` on send.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    /// Transport-level correlation id for this message.
    pub msg_id: u32,
    /// The JSON-RPC payload.
    pub json: String,
}

/// Server-side view of one client's transport channel.
///
/// Implementations must be safe to call from any thread. `send` may block
/// (await) for the duration of a single delivery; the runtime never calls it
/// while holding a registry lock.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a framed JSON reply for delivery to the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be queued; the runtime logs
    /// the failure and drops the reply without retrying.
    async fn send(&self, msg: TransportMessage) -> Result<()>;

    /// Tear down the client channel, draining any undelivered data.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel could not be torn down cleanly.
    async fn disconnect(&self) -> Result<()>;
}

/// Shared handle to a client's transport channel.
///
/// Binding identity is pointer identity: the runtime compares bindings with
/// [`Arc::ptr_eq`], so a transport must use one `Arc` per client connection.
pub type TransportBinding = Arc<dyn Transport>;
