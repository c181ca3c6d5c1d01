//! Execution registry: one record per in-flight tool invocation.
//!
//! Records move Active → Cancelled → Finished. Cancellation is cooperative:
//! the registry only flips state; the callback discovers it by polling and
//! winds down with a `CancelAck`. A record leaves the table the moment its
//! final tool message is processed, so `Finished` is never observable from
//! outside.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use emcp_core::{Error, ExecutionToken, Result};

use crate::client::ClientContext;

/// State of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionState {
    Active,
    Cancelled,
    Finished,
}

/// Book-keeping for one in-flight `tools/call`.
pub(crate) struct ExecutionContext {
    pub(crate) token: ExecutionToken,
    /// JSON-RPC id to quote in the reply.
    pub(crate) request_id: i64,
    /// Transport correlation id for the reply chunk.
    pub(crate) transport_msg_id: u32,
    /// Owning client. Not an extra protocol reference: the queue entry that
    /// triggered this execution holds the refcount for the whole chain.
    pub(crate) client: Arc<ClientContext>,
    pub(crate) tool_name: String,
    /// Worker that invoked the callback, for diagnostics only.
    pub(crate) worker_id: usize,
    pub(crate) state: ExecutionState,
    pub(crate) started: Instant,
    pub(crate) cancelled_at: Option<Instant>,
    pub(crate) last_message: Instant,
}

/// Token generation policy: the token is the transport message id. Callers
/// inside a firmware image are trusted; swap this single point for random
/// 128-bit tokens when they are not.
fn generate_token(transport_msg_id: u32) -> Option<ExecutionToken> {
    ExecutionToken::new(u64::from(transport_msg_id))
}

/// Fixed-capacity, mutex-serialised execution table.
pub(crate) struct ExecutionRegistry {
    inner: Mutex<Vec<Option<ExecutionContext>>>,
}

impl ExecutionRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<ExecutionContext>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an *Active* record and hand back its token.
    pub(crate) fn add(
        &self,
        client: Arc<ClientContext>,
        request_id: i64,
        transport_msg_id: u32,
        tool_name: String,
        worker_id: usize,
    ) -> Result<ExecutionToken> {
        let token = generate_token(transport_msg_id).ok_or_else(|| {
            Error::InvalidArgument("transport message id must be nonzero".to_string())
        })?;

        let mut slots = self.lock();
        if slots
            .iter()
            .flatten()
            .any(|exec| exec.token == token)
        {
            return Err(Error::AlreadyExists(format!(
                "execution token {token} is already in flight"
            )));
        }
        let now = Instant::now();
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(ExecutionContext {
                    token,
                    request_id,
                    transport_msg_id,
                    client,
                    tool_name,
                    worker_id,
                    state: ExecutionState::Active,
                    started: now,
                    cancelled_at: None,
                    last_message: now,
                });
                Ok(token)
            }
            None => Err(Error::NoSpace("execution")),
        }
    }

    /// Run `f` on the record for `token` under the registry lock.
    pub(crate) fn with<T>(
        &self,
        token: ExecutionToken,
        f: impl FnOnce(&mut ExecutionContext) -> T,
    ) -> Result<T> {
        let mut slots = self.lock();
        let exec = slots
            .iter_mut()
            .flatten()
            .find(|exec| exec.token == token)
            .ok_or_else(|| Error::NotFound(format!("execution token {token}")))?;
        Ok(f(exec))
    }

    /// Drop the record for `token`, returning it for final cleanup.
    pub(crate) fn remove(&self, token: ExecutionToken) -> Option<ExecutionContext> {
        let mut slots = self.lock();
        slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|exec| exec.token == token))
            .and_then(Option::take)
    }

    /// Cooperative cancellation probe for tool callbacks.
    pub(crate) fn is_cancelled(&self, token: ExecutionToken) -> Result<bool> {
        self.with(token, |exec| exec.state == ExecutionState::Cancelled)
    }

    /// Handle `notifications/cancelled`: flip the matching *Active* record,
    /// identified by request id and owning client, to *Cancelled*.
    pub(crate) fn cancel_by_request_id(
        &self,
        client: &Arc<ClientContext>,
        request_id: i64,
    ) -> Result<()> {
        let mut slots = self.lock();
        let exec = slots
            .iter_mut()
            .flatten()
            .find(|exec| {
                exec.request_id == request_id
                    && Arc::ptr_eq(&exec.client, client)
                    && exec.state == ExecutionState::Active
            })
            .ok_or_else(|| Error::NotFound(format!("active execution for request {request_id}")))?;
        exec.state = ExecutionState::Cancelled;
        exec.cancelled_at = Some(Instant::now());
        Ok(())
    }

    /// Run `f` over every occupied slot under the registry lock; used by
    /// the health monitor sweep.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&mut ExecutionContext)) {
        let mut slots = self.lock();
        for exec in slots.iter_mut().flatten() {
            f(exec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientRegistry;
    use crate::transport::{Transport, TransportBinding, TransportMessage};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _msg: TransportMessage) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn client() -> Arc<ClientContext> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = ClientRegistry::new(1, tx);
        let binding: TransportBinding = Arc::new(NullTransport);
        registry.add(binding).unwrap()
    }

    #[test]
    fn add_get_remove_round_trip() {
        let registry = ExecutionRegistry::new(2);
        let token = registry
            .add(client(), 7, 42, "echo".to_string(), 0)
            .unwrap();
        assert_eq!(token.get(), 42);
        assert!(!registry.is_cancelled(token).unwrap());

        let exec = registry.remove(token).unwrap();
        assert_eq!(exec.request_id, 7);
        assert_eq!(exec.tool_name, "echo");

        // The token is dead once removed.
        assert!(registry.is_cancelled(token).is_err());
        assert!(registry.remove(token).is_none());
    }

    #[test]
    fn zero_msg_id_is_rejected() {
        let registry = ExecutionRegistry::new(2);
        assert!(matches!(
            registry.add(client(), 1, 0, "echo".to_string(), 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn capacity_and_duplicate_tokens() {
        let registry = ExecutionRegistry::new(1);
        let c = client();
        registry
            .add(Arc::clone(&c), 1, 10, "echo".to_string(), 0)
            .unwrap();
        assert!(matches!(
            registry.add(Arc::clone(&c), 2, 10, "echo".to_string(), 0),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            registry.add(c, 2, 11, "echo".to_string(), 0),
            Err(Error::NoSpace(_))
        ));
    }

    #[test]
    fn cancel_by_request_id_matches_owner() {
        let registry = ExecutionRegistry::new(2);
        let owner = client();
        let other = client();
        let token = registry
            .add(Arc::clone(&owner), 5, 20, "echo".to_string(), 0)
            .unwrap();

        // Another client cannot cancel this request id.
        assert!(registry.cancel_by_request_id(&other, 5).is_err());

        registry.cancel_by_request_id(&owner, 5).unwrap();
        assert!(registry.is_cancelled(token).unwrap());

        // Already cancelled: no longer an *Active* match.
        assert!(registry.cancel_by_request_id(&owner, 5).is_err());
    }
}
