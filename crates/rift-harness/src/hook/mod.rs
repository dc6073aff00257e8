//! Message interception.
//!
//! This module provides:
//! - `Hook`: match criteria plus an ordered handler chain, owned by a scope
//! - `Handler`: the closed set of chain steps (assert, transform, mockEvent,
//!   proxy, delay, drop, link)
//! - `HookRegistry`: per-component ordered hook list that matches and runs
//!   chains against in-flight messages
//! - `HookBuilder`: the chainable surface test authors use to declare hooks
//!
//! ## Module Structure
//!
//! - `types`: hook record, scopes, directions and matchers
//! - `endpoint`: `/users/{id}` style endpoint patterns
//! - `handler`: handler variants and their execution
//! - `registry`: registration, matching, execution and cleanup
//! - `builder`: chainable builder and the `HookTarget` extension trait

mod builder;
mod endpoint;
mod handler;
mod registry;
mod types;


pub use builder::{HookBuilder, HookTarget};
pub use endpoint::EndpointPattern;
pub use handler::{Delay, DelayFn, Handler, PayloadCheck, PayloadFn};
pub use registry::{HookOutcome, HookRegistry, UnhandledError};
pub use types::{
    Direction, Hook, HookScope, MessageMatcher, MessagePredicate, PayloadMatcher, WaitResult,
};

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run user code, mapping a panic to `None`.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Option<T> {
    catch_unwind(AssertUnwindSafe(f)).ok()
}
