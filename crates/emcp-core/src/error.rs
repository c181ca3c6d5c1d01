//! Error types shared across the emcp runtime.

use thiserror::Error;

/// Convenience alias used throughout the emcp crates.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds surfaced by the runtime.
///
/// Handlers return one of these; the worker pool maps each kind to a
/// JSON-RPC error code and message exactly once, at the edge. Everything in
/// between propagates with `?`.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The inbound bytes are not a well-formed JSON-RPC 2.0 message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The method name is not part of the supported MCP method set.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A named resource (client, tool, execution) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A tool with the same name is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A fixed-capacity registry has no free slot.
    #[error("no space left in {0} registry")]
    NoSpace(&'static str),

    /// The bounded request queue rejected an enqueue.
    #[error("request queue full")]
    NoMemory,

    /// A serialized message would exceed the configured maximum size.
    #[error("serialized message exceeds {max} bytes")]
    OutOfSpace {
        /// The configured maximum message size.
        max: usize,
    },

    /// The operation is not allowed in the client's current lifecycle state.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The client has not completed the initialize handshake.
    #[error("client not initialized")]
    AccessDenied,

    /// The client is at its concurrent-request cap, or the tool is in use.
    #[error("busy: {0}")]
    Busy(String),

    /// The transport binding reported a delivery failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::NotFound("tool 'echo'".to_string());
        assert_eq!(err.to_string(), "not found: tool 'echo'");

        let err = Error::OutOfSpace { max: 1024 };
        assert_eq!(err.to_string(), "serialized message exceeds 1024 bytes");
    }

    #[test]
    fn access_denied_is_contextless() {
        assert_eq!(Error::AccessDenied.to_string(), "client not initialized");
    }
}
