//! Shared foundation types for the emcp server runtime.
//!
//! This crate holds the pieces that every other emcp crate agrees on: the
//! closed [`Error`] kind set that handlers surface and the worker edge maps
//! to JSON-RPC codes, and the [`ExecutionToken`] identifying one in-flight
//! tool invocation.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod token;

pub use error::{Error, Result};
pub use token::ExecutionToken;
