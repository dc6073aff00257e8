//! HookRegistry - ordered hook storage, matching and execution.
//!
//! Every hook whose matcher accepts a message runs, in registration order,
//! each one receiving the previous hook's output. A `Drop` anywhere ends the
//! pipeline. A failing handler ends it too: the error is recorded on the
//! registry and returned to the caller.

use super::handler::{Flow, InFlight};
use super::types::{Direction, Hook, HookScope};
use crate::error::HookError;
use crate::message::Message;
use crate::race::race;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of running a message through the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Continue on the normal path (possibly transformed).
    Forward(Message),
    /// Send back to where the message came from instead of forwarding.
    Reply(Message),
    /// Consumed; neither forwarded nor replied to.
    Dropped,
}

/// A handler failure that happened on live traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnhandledError {
    pub component: String,
    pub hook_id: String,
    pub message_type: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Hooks owned by a single component.
pub struct HookRegistry {
    owner: String,
    hooks: RwLock<Vec<Arc<Hook>>>,
    unhandled: Mutex<Vec<UnhandledError>>,
}

impl HookRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            hooks: RwLock::new(Vec::new()),
            unhandled: Mutex::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Append a hook and return its id.
    pub fn register_hook(&self, hook: Hook) -> String {
        let id = hook.id.clone();
        debug!(
            "[{}] Registered hook {} on '{}' ({:?})",
            self.owner,
            id,
            hook.matcher.label(),
            hook.scope
        );
        self.hooks.write().push(Arc::new(hook));
        id
    }

    pub fn remove_hook(&self, id: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| h.id != id);
        hooks.len() != before
    }

    /// Remove non-persistent hooks: those of one test case, or all of them.
    /// Scenario hooks always survive. Returns the number removed.
    pub fn clear_test_case_hooks(&self, test_case_id: Option<&str>) -> usize {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|h| match (&h.scope, test_case_id) {
            (HookScope::Scenario, _) => true,
            (HookScope::TestCase(owner), Some(target)) => owner != target,
            (HookScope::TestCase(_), None) => false,
        });
        let removed = before - hooks.len();
        if removed > 0 {
            debug!(
                "[{}] Cleared {} hook(s) for test case {:?}",
                self.owner, removed, test_case_id
            );
        }
        removed
    }

    /// Remove every hook, persistent ones included.
    pub fn clear(&self) -> usize {
        let mut hooks = self.hooks.write();
        let removed = hooks.len();
        hooks.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn hook_ids(&self) -> Vec<String> {
        self.hooks.read().iter().map(|h| h.id.clone()).collect()
    }

    /// Hooks accepting `message`, in registration order.
    pub fn matching_hooks(&self, message: &Message, direction: Direction) -> Vec<Arc<Hook>> {
        self.hooks
            .read()
            .iter()
            .filter(|h| h.accepts(message, direction))
            .cloned()
            .collect()
    }

    pub fn unhandled_errors(&self) -> Vec<UnhandledError> {
        self.unhandled.lock().clone()
    }

    pub fn take_unhandled_errors(&self) -> Vec<UnhandledError> {
        std::mem::take(&mut *self.unhandled.lock())
    }

    fn record_unhandled(&self, hook: &Hook, message_type: &str, error: &HookError) {
        warn!(
            "[{}] Hook {} failed on '{}': {}",
            self.owner, hook.id, message_type, error
        );
        self.unhandled.lock().push(UnhandledError {
            component: self.owner.clone(),
            hook_id: hook.id.clone(),
            message_type: message_type.to_string(),
            error: error.to_string(),
            recorded_at: Utc::now(),
        });
    }

    /// Run every matching hook against `message`.
    ///
    /// Matching is decided against the message as it arrived; each matched
    /// hook then sees the output of the one before it.
    pub async fn execute_hooks(
        &self,
        message: Message,
        direction: Direction,
    ) -> Result<HookOutcome, HookError> {
        let matching = self.matching_hooks(&message, direction);
        if matching.is_empty() {
            return Ok(HookOutcome::Forward(message));
        }

        let message_type = message.message_type.clone();
        let mut state = InFlight {
            message,
            reply: false,
        };

        for hook in matching {
            match self.run_chain(&hook, state.clone()).await {
                Ok(Some(next)) => {
                    hook.resolve_waiter(Ok(next.message.clone()));
                    state = next;
                }
                Ok(None) => {
                    debug!(
                        "[{}] Hook {} dropped '{}' ({})",
                        self.owner, hook.id, message_type, direction
                    );
                    hook.resolve_waiter(Ok(state.message));
                    return Ok(HookOutcome::Dropped);
                }
                Err(error) => {
                    self.record_unhandled(&hook, &message_type, &error);
                    hook.resolve_waiter(Err(error.to_string()));
                    return Err(error);
                }
            }
        }

        // Only a response of a different type goes back to the sender; a
        // same-typed mock is just a rewrite of the message in flight.
        Ok(if state.reply && state.message.message_type != message_type {
            HookOutcome::Reply(state.message)
        } else {
            HookOutcome::Forward(state.message)
        })
    }

    /// Run one hook's chain. `None` means the message was dropped.
    async fn run_chain(&self, hook: &Hook, state: InFlight) -> Result<Option<InFlight>, HookError> {
        let chain = async move {
            let mut state = state;
            for handler in &hook.handlers {
                if let Flow::Dropped = handler.apply(&hook.id, &mut state).await? {
                    return Ok(None);
                }
            }
            Ok(Some(state))
        };

        match hook.timeout {
            Some(limit) => race(chain, limit).await.unwrap_or_else(|_| {
                Err(HookError::TimedOut {
                    hook: hook.id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
            None => chain.await,
        }
    }
}
