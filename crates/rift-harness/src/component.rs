//! Component contract and lifecycle state machine.

use crate::error::HarnessError;
use crate::hook::{HookRegistry, UnhandledError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle states of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Created => "created",
            ComponentState::Starting => "starting",
            ComponentState::Started => "started",
            ComponentState::Stopping => "stopping",
            ComponentState::Stopped => "stopped",
            ComponentState::Error => "error",
        }
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: ComponentState) -> bool {
        use ComponentState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Stopped, Starting)
                | (Starting, Started)
                | (Starting, Error)
                | (Started, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Error)
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guarded state holder shared by every component implementation.
pub struct Lifecycle {
    component: String,
    state: RwLock<ComponentState>,
}

impl Lifecycle {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: RwLock::new(ComponentState::Created),
        }
    }

    pub fn state(&self) -> ComponentState {
        *self.state.read()
    }

    /// Move to `next`, failing if the transition is not allowed.
    pub fn transition(&self, next: ComponentState) -> Result<ComponentState, HarnessError> {
        let mut state = self.state.write();
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(HarnessError::InvalidTransition {
                component: self.component.clone(),
                from,
                to: next,
            });
        }
        *state = next;
        debug!("Component '{}' {} -> {}", self.component, from, next);
        Ok(from)
    }

    pub fn begin_start(&self) -> Result<(), HarnessError> {
        self.transition(ComponentState::Starting).map(|_| ())
    }

    /// Enter `Stopping`. Returns `false` when the component never started or
    /// is already stopping or stopped, in which case the caller does nothing.
    pub fn begin_stop(&self) -> Result<bool, HarnessError> {
        let mut state = self.state.write();
        let from = *state;
        match from {
            ComponentState::Created | ComponentState::Stopping | ComponentState::Stopped => {
                Ok(false)
            }
            _ if from.can_transition_to(ComponentState::Stopping) => {
                *state = ComponentState::Stopping;
                debug!(
                    "Component '{}' {} -> {}",
                    self.component,
                    from,
                    ComponentState::Stopping
                );
                Ok(true)
            }
            _ => Err(HarnessError::InvalidTransition {
                component: self.component.clone(),
                from,
                to: ComponentState::Stopping,
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.state() == ComponentState::Started
    }
}

/// A registered participant of a scenario: a mock/proxy server, a client, or
/// anything else that owns a [`HookRegistry`].
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ComponentState;

    fn registry(&self) -> &HookRegistry;

    async fn start(&self) -> Result<(), HarnessError>;

    /// Stop the component. Stopping a stopped component is a no-op.
    async fn stop(&self) -> Result<(), HarnessError>;

    /// Remove test-case scoped hooks, all of them when `test_case_id` is `None`.
    fn clear_test_case_hooks(&self, test_case_id: Option<&str>) -> Result<usize, HarnessError> {
        Ok(self.registry().clear_test_case_hooks(test_case_id))
    }

    fn unhandled_errors(&self) -> Vec<UnhandledError> {
        self.registry().unhandled_errors()
    }
}
