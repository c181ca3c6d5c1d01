//! Client session registry.
//!
//! One [`ClientContext`] per connected MCP session, held in a fixed slot
//! table sized at construction. Teardown is two-phase: `remove` flips the
//! lifecycle to *Deinitialized* immediately, but the slot only resets (and
//! the transport only disconnects) once the last outstanding [`ClientRef`]
//! drops. A worker that is mid-handler for a removed client therefore
//! finishes safely on a still-valid context.
//!
//! Async `disconnect` cannot run inside `Drop`, so the final reference
//! pushes the binding onto an unbounded reaper channel; the server drains
//! it from a spawned task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use emcp_core::{Error, Result};

use crate::transport::TransportBinding;

/// Session lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    /// Slot is free (or retired and waiting for the last reference).
    Deinitialized,
    /// Slot claimed by an `initialize` request, reply not yet built.
    New,
    /// `initialize` reply sent; waiting for `notifications/initialized`.
    Initializing,
    /// Fully established; may call ping, tools/list, tools/call.
    Initialized,
}

struct ClientState {
    lifecycle: LifecycleState,
    refcount: u32,
    active_requests: usize,
    last_message: Instant,
    binding: Option<TransportBinding>,
}

/// One client session slot. Allocated once and reused for the lifetime of
/// the server, like the static table it replaces.
pub(crate) struct ClientContext {
    index: usize,
    state: Mutex<ClientState>,
    reaper: mpsc::UnboundedSender<TransportBinding>,
}

impl ClientContext {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot index, for log correlation only.
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    #[cfg(test)]
    pub(crate) fn lifecycle(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    /// Current transport binding, if the slot is live.
    pub(crate) fn binding(&self) -> Option<TransportBinding> {
        self.lock().binding.clone()
    }

    /// Record inbound traffic for the idle sweep.
    pub(crate) fn touch(&self) {
        self.lock().last_message = Instant::now();
    }

    /// Transition `from` → `to`, failing if the current state differs.
    pub(crate) fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        let mut st = self.lock();
        if st.lifecycle != from {
            return Err(Error::PermissionDenied(format!(
                "invalid lifecycle transition from {:?}",
                st.lifecycle
            )));
        }
        st.lifecycle = to;
        Ok(())
    }

    /// Take a reference for the duration of a handler or queue entry.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<ClientRef> {
        let mut st = self.lock();
        if st.lifecycle == LifecycleState::Deinitialized {
            return None;
        }
        st.refcount = st.refcount.saturating_add(1);
        Some(ClientRef {
            ctx: Arc::clone(self),
        })
    }

    /// Like [`acquire`](Self::acquire), but only for *Initialized* clients.
    pub(crate) fn acquire_initialized(self: &Arc<Self>) -> Result<ClientRef> {
        let mut st = self.lock();
        if st.lifecycle != LifecycleState::Initialized {
            return Err(Error::AccessDenied);
        }
        st.refcount = st.refcount.saturating_add(1);
        Ok(ClientRef {
            ctx: Arc::clone(self),
        })
    }

    /// Admission check for one more `tools/call`: requires *Initialized*,
    /// enforces the per-client cap, and bumps both the active-request count
    /// and the refcount in one critical section.
    pub(crate) fn begin_request(self: &Arc<Self>, max_requests: usize) -> Result<ClientRef> {
        let mut st = self.lock();
        if st.lifecycle != LifecycleState::Initialized {
            return Err(Error::AccessDenied);
        }
        if st.active_requests >= max_requests {
            return Err(Error::Busy(format!(
                "client {} reached {max_requests} active requests",
                self.index
            )));
        }
        st.active_requests = st.active_requests.saturating_add(1);
        st.refcount = st.refcount.saturating_add(1);
        Ok(ClientRef {
            ctx: Arc::clone(self),
        })
    }

    /// Release one active-request slot (execution finished or rolled back).
    pub(crate) fn end_request(&self) {
        let mut st = self.lock();
        st.active_requests = st.active_requests.saturating_sub(1);
    }

    fn put(&self) {
        let binding = {
            let mut st = self.lock();
            st.refcount = st.refcount.saturating_sub(1);
            if st.refcount > 0 {
                return;
            }
            // Last reference: reset the slot for reuse and hand the binding
            // to the reaper for disconnection.
            st.lifecycle = LifecycleState::Deinitialized;
            st.active_requests = 0;
            st.binding.take()
        };
        if let Some(binding) = binding {
            debug!(client = self.index, "releasing client slot");
            if self.reaper.send(binding).is_err() {
                debug!(client = self.index, "disconnect reaper gone; dropping binding");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn active_requests(&self) -> usize {
        self.lock().active_requests
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> u32 {
        self.lock().refcount
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ClientContext")
            .field("index", &self.index)
            .field("lifecycle", &st.lifecycle)
            .field("refcount", &st.refcount)
            .finish_non_exhaustive()
    }
}

/// RAII reference to a client slot; dropping it is the `put`.
pub(crate) struct ClientRef {
    ctx: Arc<ClientContext>,
}

impl ClientRef {
    pub(crate) fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        self.ctx.put();
    }
}

/// Fixed-capacity table of client slots.
pub(crate) struct ClientRegistry {
    slots: Vec<Arc<ClientContext>>,
    /// Serialises slot allocation so one binding cannot claim two slots.
    alloc: Mutex<()>,
}

impl ClientRegistry {
    pub(crate) fn new(
        max_clients: usize,
        reaper: mpsc::UnboundedSender<TransportBinding>,
    ) -> Self {
        let slots = (0..max_clients)
            .map(|index| {
                Arc::new(ClientContext {
                    index,
                    state: Mutex::new(ClientState {
                        lifecycle: LifecycleState::Deinitialized,
                        refcount: 0,
                        active_requests: 0,
                        last_message: Instant::now(),
                        binding: None,
                    }),
                    reaper: reaper.clone(),
                })
            })
            .collect();
        Self {
            slots,
            alloc: Mutex::new(()),
        }
    }

    /// Claim a free slot for a new session on `binding`.
    ///
    /// The returned context carries the creation-time reference; it is
    /// dropped again by [`remove`](Self::remove).
    pub(crate) fn add(&self, binding: TransportBinding) -> Result<Arc<ClientContext>> {
        let _alloc = self.alloc.lock().unwrap_or_else(PoisonError::into_inner);
        if self.find_by_binding(&binding).is_some() {
            return Err(Error::AlreadyExists(
                "a client is already bound to this transport".to_string(),
            ));
        }
        for ctx in &self.slots {
            let mut st = ctx.lock();
            if st.lifecycle == LifecycleState::Deinitialized && st.refcount == 0 {
                st.lifecycle = LifecycleState::New;
                st.refcount = 1;
                st.active_requests = 0;
                st.last_message = Instant::now();
                st.binding = Some(binding);
                return Ok(Arc::clone(ctx));
            }
        }
        Err(Error::NoSpace("client"))
    }

    fn find_by_binding(&self, binding: &TransportBinding) -> Option<Arc<ClientContext>> {
        self.slots
            .iter()
            .find(|ctx| {
                let st = ctx.lock();
                st.lifecycle != LifecycleState::Deinitialized
                    && st.binding.as_ref().is_some_and(|b| Arc::ptr_eq(b, binding))
            })
            .cloned()
    }

    /// Look up the live client owning `binding` and take a reference.
    pub(crate) fn get_by_binding(&self, binding: &TransportBinding) -> Option<ClientRef> {
        self.find_by_binding(binding).and_then(|ctx| ctx.acquire())
    }

    /// Retire a session: the state flips immediately, the slot is reclaimed
    /// when the last reference drops.
    pub(crate) fn remove(&self, ctx: &Arc<ClientContext>) {
        {
            let mut st = ctx.lock();
            if st.lifecycle == LifecycleState::Deinitialized {
                return;
            }
            st.lifecycle = LifecycleState::Deinitialized;
        }
        // Drop the creation-time reference.
        ctx.put();
    }

    /// Remove every non-free client silent for longer than `timeout`.
    pub(crate) fn sweep_idle(&self, timeout: Duration) {
        for ctx in &self.slots {
            let expired = {
                let st = ctx.lock();
                st.lifecycle != LifecycleState::Deinitialized
                    && st.last_message.elapsed() > timeout
            };
            if expired {
                warn!(client = ctx.index(), "client exceeded idle timeout, removing");
                self.remove(ctx);
            }
        }
    }

}
