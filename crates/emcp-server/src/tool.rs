//! Tool registry and the application-facing tool contract.
//!
//! Applications register a [`ToolRecord`] (metadata + handler) per tool.
//! Records are immutable after registration except for the activity
//! counter, which counts in-flight executions and gates removal: a tool
//! with live executions cannot be pulled out from under them.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use emcp_core::{Error, ExecutionToken, Result};

/// Why the runtime is calling into the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEvent {
    /// A `tools/call` request for this tool.
    Invoke,
    /// The execution was cancelled; the callback should wind down and
    /// acknowledge with [`ToolMessage::CancelAck`].
    CancelRequest,
}

/// Message a tool callback submits back to the runtime.
#[derive(Debug, Clone)]
pub enum ToolMessage {
    /// Liveness ping from a long-running callback. Refreshes the idle
    /// timeout; nothing goes on the wire.
    Ping,
    /// Final result. Exactly one per execution.
    Response {
        /// Text content of the reply.
        text: String,
        /// Marks the result as a tool-level error (`isError` on the wire).
        is_error: bool,
    },
    /// Acknowledges an observed cancellation. Final; nothing goes on the
    /// wire.
    CancelAck,
}

/// Application callback invoked for `tools/call`.
///
/// The callback runs on a request worker and may take as long as it needs,
/// but long-running work should submit [`ToolMessage::Ping`] periodically
/// and poll `is_execution_cancelled` so the health monitor can tell a slow
/// tool from a stuck one. A well-behaved callback terminates by submitting
/// exactly one final message: a `Response`, or a `CancelAck` if it observed
/// cancellation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Handle an invocation (or a cancel request) for this tool.
    ///
    /// `arguments` is the raw JSON of the request's `arguments` object,
    /// exactly as the client sent it.
    ///
    /// # Errors
    ///
    /// Returning an error rolls the execution back and surfaces a JSON-RPC
    /// error to the client; no final [`ToolMessage`] is expected then.
    async fn invoke(
        &self,
        event: ToolEvent,
        arguments: Option<&str>,
        token: ExecutionToken,
    ) -> Result<()>;
}

/// Descriptive half of a tool registration; everything `tools/list`
/// reports.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    /// Unique tool name.
    pub name: String,
    /// Optional display title.
    pub title: Option<String>,
    /// Optional human-readable description.
    pub description: Option<String>,
    /// JSON schema of the `arguments` object.
    pub input_schema: Value,
    /// Optional JSON schema of the result content.
    pub output_schema: Option<Value>,
}

impl ToolMetadata {
    /// Metadata with just the required fields.
    #[must_use]
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: None,
            input_schema,
            output_schema: None,
        }
    }

    /// Set the display title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the output schema.
    #[must_use]
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// One registered tool: metadata plus the callback.
pub struct ToolRecord {
    pub(crate) metadata: ToolMetadata,
    pub(crate) handler: Arc<dyn ToolHandler>,
}

impl ToolRecord {
    /// Bundle metadata with its handler.
    #[must_use]
    pub fn new(metadata: ToolMetadata, handler: Arc<dyn ToolHandler>) -> Self {
        Self { metadata, handler }
    }

    /// The tool's metadata.
    #[must_use]
    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }
}

impl std::fmt::Debug for ToolRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRecord")
            .field("name", &self.metadata.name)
            .finish_non_exhaustive()
    }
}

struct ToolEntry {
    record: ToolRecord,
    activity: u32,
}

/// Fixed-capacity, mutex-serialised tool table.
pub(crate) struct ToolRegistry {
    inner: Mutex<Vec<Option<ToolEntry>>>,
}

impl ToolRegistry {
    pub(crate) fn new(max_tools: usize) -> Self {
        let mut slots = Vec::with_capacity(max_tools);
        slots.resize_with(max_tools, || None);
        Self {
            inner: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<ToolEntry>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, record: ToolRecord, max_name_len: usize) -> Result<()> {
        if record.metadata.name.is_empty() {
            return Err(Error::InvalidArgument("tool name is empty".to_string()));
        }
        if record.metadata.name.len() > max_name_len {
            return Err(Error::InvalidArgument(format!(
                "tool name exceeds {max_name_len} bytes"
            )));
        }

        let mut slots = self.lock();
        if slots
            .iter()
            .flatten()
            .any(|entry| entry.record.metadata.name == record.metadata.name)
        {
            return Err(Error::AlreadyExists(record.metadata.name.clone()));
        }
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(ToolEntry {
                    record,
                    activity: 0,
                });
                Ok(())
            }
            None => Err(Error::NoSpace("tool")),
        }
    }

    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        let mut slots = self.lock();
        let slot = slots
            .iter_mut()
            .find(|slot| {
                slot.as_ref()
                    .is_some_and(|entry| entry.record.metadata.name == name)
            })
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        let entry = slot.as_ref().ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        if entry.activity > 0 {
            return Err(Error::Busy(format!("tool '{name}' has active executions")));
        }
        *slot = None;
        Ok(())
    }

    /// Copy of every registered tool's metadata, in slot order.
    pub(crate) fn metadata_snapshot(&self) -> Vec<ToolMetadata> {
        self.lock()
            .iter()
            .flatten()
            .map(|entry| entry.record.metadata.clone())
            .collect()
    }

    /// Look up `name` and bind one execution to it; pairs with
    /// [`end_execution`](Self::end_execution).
    pub(crate) fn begin_execution(&self, name: &str) -> Result<Arc<dyn ToolHandler>> {
        let mut slots = self.lock();
        let entry = slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.record.metadata.name == name)
            .ok_or_else(|| Error::NotFound(format!("tool '{name}'")))?;
        entry.activity = entry.activity.saturating_add(1);
        Ok(Arc::clone(&entry.record.handler))
    }

    /// Release one execution binding taken by
    /// [`begin_execution`](Self::begin_execution).
    pub(crate) fn end_execution(&self, name: &str) {
        let mut slots = self.lock();
        if let Some(entry) = slots
            .iter_mut()
            .flatten()
            .find(|entry| entry.record.metadata.name == name)
        {
            entry.activity = entry.activity.saturating_sub(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn activity(&self, name: &str) -> Option<u32> {
        self.lock()
            .iter()
            .flatten()
            .find(|entry| entry.record.metadata.name == name)
            .map(|entry| entry.activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopTool;

    #[async_trait]
    impl ToolHandler for NoopTool {
        async fn invoke(
            &self,
            _event: ToolEvent,
            _arguments: Option<&str>,
            _token: ExecutionToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn record(name: &str) -> ToolRecord {
        ToolRecord::new(
            ToolMetadata::new(name, json!({"type": "object"})),
            Arc::new(NoopTool),
        )
    }

    #[test]
    fn add_then_duplicate_fails() {
        let registry = ToolRegistry::new(8);
        registry.add(record("dup"), 32).unwrap();
        assert!(matches!(
            registry.add(record("dup"), 32),
            Err(Error::AlreadyExists(_))
        ));
        // The first record remains listed.
        assert_eq!(registry.metadata_snapshot().len(), 1);
    }

    #[test]
    fn capacity_boundary() {
        let registry = ToolRegistry::new(2);
        registry.add(record("a"), 32).unwrap();
        registry.add(record("b"), 32).unwrap();
        assert!(matches!(
            registry.add(record("c"), 32),
            Err(Error::NoSpace(_))
        ));
        // Removal frees the slot for a new registration.
        registry.remove("a").unwrap();
        registry.add(record("c"), 32).unwrap();
    }

    #[test]
    fn invalid_names_are_rejected() {
        let registry = ToolRegistry::new(2);
        assert!(matches!(
            registry.add(record(""), 32),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.add(record(&"x".repeat(33)), 32),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn busy_tool_cannot_be_removed() {
        let registry = ToolRegistry::new(2);
        registry.add(record("probe"), 32).unwrap();

        let _handler = registry.begin_execution("probe").unwrap();
        assert_eq!(registry.activity("probe"), Some(1));
        assert!(matches!(registry.remove("probe"), Err(Error::Busy(_))));

        registry.end_execution("probe");
        assert_eq!(registry.activity("probe"), Some(0));
        registry.remove("probe").unwrap();
        assert!(matches!(
            registry.remove("probe"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn begin_execution_unknown_tool() {
        let registry = ToolRegistry::new(2);
        assert!(matches!(
            registry.begin_execution("ghost"),
            Err(Error::NotFound(_))
        ));
    }
}
