//! In-memory transport for exercising the server without a wire.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use emcp_core::{Error, Result};
use emcp_server::{Transport, TransportBinding, TransportMessage};

/// One message the server pushed through [`Transport::send`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Transport correlation id the server quoted back.
    pub msg_id: u32,
    /// The serialized JSON-RPC payload.
    pub json: String,
}

impl SentMessage {
    /// Parse the payload.
    ///
    /// # Panics
    ///
    /// Panics if the payload is not valid JSON.
    #[must_use]
    pub fn value(&self) -> serde_json::Value {
        serde_json::from_str(&self.json).expect("sent message is valid JSON")
    }
}

/// Mock transport binding: records every send, counts disconnects, and can
/// inject send failures. One instance models one client connection.
pub struct MockTransport {
    sent: Mutex<Vec<SentMessage>>,
    notify_tx: mpsc::UnboundedSender<SentMessage>,
    notify_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SentMessage>>,
    disconnects: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockTransport {
    /// Create a fresh mock client connection.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx: tokio::sync::Mutex::new(notify_rx),
            disconnects: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// This connection as a [`TransportBinding`].
    #[must_use]
    pub fn binding(self: &Arc<Self>) -> TransportBinding {
        Arc::clone(self) as TransportBinding
    }

    /// Number of successful sends so far.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.lock_sent().len()
    }

    /// The most recently sent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<SentMessage> {
        self.lock_sent().last().cloned()
    }

    /// Number of disconnect calls so far.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Make subsequent sends fail until called with `false` again.
    pub fn set_send_failure(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Await the next sent message.
    ///
    /// # Panics
    ///
    /// Panics if no message arrives within two seconds.
    pub async fn expect_message(&self) -> SentMessage {
        let mut rx = self.notify_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a transport send")
            .expect("mock transport channel closed")
    }

    /// Assert that nothing is sent within `window`.
    ///
    /// # Panics
    ///
    /// Panics if a message arrives inside the window.
    pub async fn expect_silence(&self, window: Duration) {
        let mut rx = self.notify_rx.lock().await;
        if let Ok(Some(msg)) = tokio::time::timeout(window, rx.recv()).await {
            panic!("expected transport silence, got: {}", msg.json);
        }
    }

    fn lock_sent(&self) -> std::sync::MutexGuard<'_, Vec<SentMessage>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, msg: TransportMessage) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("injected send failure".to_string()));
        }
        let sent = SentMessage {
            msg_id: msg.msg_id,
            json: msg.json,
        };
        self.lock_sent().push(sent.clone());
        // A closed receiver only means the test has stopped listening.
        let _ = self.notify_tx.send(sent);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
