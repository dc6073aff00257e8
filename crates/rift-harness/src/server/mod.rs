//! Proxy/mock session engine.
//!
//! This module provides:
//! - `AsyncServer`: a component that listens, pairs every inbound connection
//!   with at most one outbound connection, and routes traffic through its
//!   hook registry
//! - `ServerMode`: mock (hooks answer) or proxy (forward to a target)
//!
//! ## Module Structure
//!
//! - `types`: mode and connect failure records
//! - `session`: session state and the shared outbound connect attempt
//! - `core`: AsyncServer, routing, linked disconnect and teardown

mod core;
mod session;
mod types;


pub use self::core::AsyncServer;
pub use types::{ConnectFailure, ServerMode};
