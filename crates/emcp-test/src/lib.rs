//! Shared test utilities for the emcp server runtime.
//!
//! Provides the in-memory [`MockTransport`], canned tool handlers, and
//! request builders used by unit and integration tests. Helpers panic on
//! misuse instead of returning errors; they are not for production code.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]

mod fixtures;
mod mocks;

pub use fixtures::{
    cancelled_notification, establish_session, init_tracing, initialize_request,
    initialize_request_with_version, initialized_notification, ping_request, tools_call_request,
    tools_list_request, CapturedInvocation, CooperativeSleeper, FailingTool, ManualTool, ReplyTool,
};
pub use mocks::{MockTransport, SentMessage};
