// Library exports for the harness binary and integration tests

// ===== Interception core =====
pub mod hook;
pub mod server;
pub mod step;

// ===== Components & orchestration =====
pub mod client;
pub mod component;
pub mod scenario;

// ===== Plumbing =====
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod race;
pub mod transport;

pub use client::Client;
pub use component::{Component, ComponentState, Lifecycle};
pub use error::{HarnessError, HookError, TransportError};
pub use hook::{
    Delay, Direction, EndpointPattern, Handler, Hook, HookBuilder, HookOutcome, HookRegistry,
    HookScope, HookTarget, MessageMatcher, PayloadMatcher, UnhandledError,
};
pub use message::Message;
pub use scenario::{GroupMode, Scenario, ScenarioResult, TestCase, TestGroup};
pub use server::{AsyncServer, ConnectFailure, ServerMode};
pub use step::{
    Step, StepExecutor, StepFailure, StepMode, StepResult, StepStatus, TestCaseResult,
};
