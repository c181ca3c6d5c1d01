//! Execution token identifying one in-flight tool invocation.

use std::fmt;
use std::num::NonZeroU64;

/// Opaque, non-zero identifier for an in-flight tool invocation.
///
/// A token is handed to the tool callback on `tools/call` and must be quoted
/// back on every [`submit_tool_message`] and cancellation poll. Zero is not
/// representable: a zeroed slot in the execution registry means "free".
///
/// [`submit_tool_message`]: https://docs.rs/emcp-server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionToken(NonZeroU64);

impl ExecutionToken {
    /// Create a token from a raw value, rejecting zero.
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw token value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ExecutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
