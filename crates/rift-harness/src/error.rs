//! Error types shared across the harness.
//!
//! Each layer owns its own enum: transports report [`TransportError`], handler
//! chains report [`HookError`], and components report [`HarnessError`] which
//! wraps the other two.

use crate::component::ComponentState;

/// Failures of the connection/listener contract.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection {0} is not connected")]
    NotConnected(String),
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),
    #[error("Address {0} is already in use")]
    AddressInUse(String),
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),
    #[error("Frame codec error: {0}")]
    Codec(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised while running a hook's handler chain.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Assertion failed in hook {hook}: {description}")]
    AssertionFailed { hook: String, description: String },
    #[error("Handler failed in hook {hook} ({description}): {source}")]
    Handler {
        hook: String,
        description: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Handler panicked in hook {hook}: {description}")]
    Panicked { hook: String, description: String },
    #[error("Hook {hook} did not finish within {timeout_ms}ms")]
    TimedOut { hook: String, timeout_ms: u64 },
}

impl HookError {
    /// Id of the hook whose chain failed.
    pub fn hook_id(&self) -> &str {
        match self {
            HookError::AssertionFailed { hook, .. }
            | HookError::Handler { hook, .. }
            | HookError::Panicked { hook, .. }
            | HookError::TimedOut { hook, .. } => hook,
        }
    }
}

/// Component-level failures.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Component '{component}' cannot move from {from} to {to}")]
    InvalidTransition {
        component: String,
        from: ComponentState,
        to: ComponentState,
    },
    #[error("Component '{0}' is not started")]
    NotStarted(String),
    #[error("Timed out after {timeout_ms}ms connecting to {target}")]
    ConnectTimeout { target: String, timeout_ms: u64 },
    #[error("Session {0} not found")]
    SessionNotFound(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Hook(#[from] HookError),
}
