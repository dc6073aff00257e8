//! Declarative test steps and their three-phase execution.
//!
//! ## Module Structure
//!
//! - `result`: serializable step and test case results
//! - `executor`: register hooks, execute, then always clean up

mod executor;
mod result;

#[cfg(test)]
mod tests;

pub use executor::StepExecutor;
pub use result::{StepFailure, StepResult, StepStatus, TestCaseResult};

use crate::component::Component;
use crate::hook::HookBuilder;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a step does in each execution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// Runs in phase 2.
    Action,
    /// Registers a hook in phase 1; nothing to do in phase 2.
    Hook,
    /// Registers a hook in phase 1; blocks in phase 2 until it matched.
    Wait,
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepMode::Action => f.write_str("action"),
            StepMode::Hook => f.write_str("hook"),
            StepMode::Wait => f.write_str("wait"),
        }
    }
}

pub type ActionFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type ActionFn = Box<dyn FnOnce() -> ActionFuture + Send>;

pub(crate) enum StepKind {
    Action(ActionFn),
    Hook(HookBuilder),
    Wait(HookBuilder),
}

/// One declared unit of test behavior, bound to a component.
pub struct Step {
    component: Arc<dyn Component>,
    description: Option<String>,
    pub(crate) kind: StepKind,
}

impl Step {
    pub fn action<F, Fut>(
        component: Arc<dyn Component>,
        description: impl Into<String>,
        action: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            component,
            description: Some(description.into()),
            kind: StepKind::Action(Box::new(move || action().boxed())),
        }
    }

    pub fn mode(&self) -> StepMode {
        match self.kind {
            StepKind::Action(_) => StepMode::Action,
            StepKind::Hook(_) => StepMode::Hook,
            StepKind::Wait(_) => StepMode::Wait,
        }
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Matcher label for hook and wait steps.
    pub fn message_type(&self) -> Option<String> {
        match self.kind {
            StepKind::Action(_) => None,
            StepKind::Hook(ref builder) | StepKind::Wait(ref builder) => {
                Some(builder.matcher().label())
            }
        }
    }
}

impl From<HookBuilder> for Step {
    fn from(builder: HookBuilder) -> Self {
        let component = Arc::clone(builder.component());
        let description = builder.step_description().map(str::to_string);
        let kind = match builder.mode() {
            StepMode::Wait => StepKind::Wait(builder),
            _ => StepKind::Hook(builder),
        };
        Self {
            component,
            description,
            kind,
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("mode", &self.mode())
            .field("component", &self.component.name())
            .field("message_type", &self.message_type())
            .field("description", &self.description)
            .finish()
    }
}
