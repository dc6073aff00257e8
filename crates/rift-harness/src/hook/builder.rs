//! Chainable hook declaration.
//!
//! ```ignore
//! server.on_message("Ping")
//!     .assert(|p| p["seq"].is_u64())
//!     .describe("seq must be numeric")
//!     .mock_event("Pong", |p| json!({"seq": p["seq"]}));
//! ```

use super::handler::{Delay, Handler};
use super::types::{Direction, Hook, HookScope, MessageMatcher, PayloadMatcher, WaitResult, Waiter};
use crate::component::Component;
use crate::message::Message;
use crate::step::{Step, StepMode};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Declares a hook (or a wait) on one component.
///
/// Nothing is registered until the step executor arms it, or until
/// [`HookBuilder::register_persistent`] is called.
pub struct HookBuilder {
    component: Arc<dyn Component>,
    mode: StepMode,
    matcher: MessageMatcher,
    payload_matcher: PayloadMatcher,
    direction: Direction,
    handlers: Vec<Handler>,
    timeout: Option<Duration>,
    description: Option<String>,
}

impl HookBuilder {
    pub fn new(
        component: Arc<dyn Component>,
        matcher: impl Into<MessageMatcher>,
        direction: Direction,
    ) -> Self {
        Self {
            component,
            mode: StepMode::Hook,
            matcher: matcher.into(),
            payload_matcher: PayloadMatcher::None,
            direction,
            handlers: Vec::new(),
            timeout: None,
            description: None,
        }
    }

    /// A builder whose step blocks until a matching message went through
    /// the chain.
    pub fn wait(
        component: Arc<dyn Component>,
        matcher: impl Into<MessageMatcher>,
        direction: Direction,
    ) -> Self {
        Self {
            mode: StepMode::Wait,
            ..Self::new(component, matcher, direction)
        }
    }

    fn push(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn assert<F>(self, check: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.push(Handler::Assert {
            check: Arc::new(check),
            description: None,
        })
    }

    pub fn transform<F>(self, transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.try_transform(move |p| Ok(transform(p)))
    }

    /// Transform that may fail; the error fails the message's chain.
    pub fn try_transform<F>(self, transform: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.push(Handler::Transform {
            transform: Arc::new(transform),
            description: None,
        })
    }

    /// Answer the message directly with an event of `event_type`.
    pub fn mock_event<F>(self, event_type: impl Into<String>, build: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.push(Handler::MockEvent {
            event_type: event_type.into(),
            build: Arc::new(move |p| Ok(build(p))),
            description: None,
        })
    }

    /// Forward unchanged.
    pub fn proxy(self) -> Self {
        self.push(Handler::Proxy {
            transform: None,
            description: None,
        })
    }

    pub fn proxy_with<F>(self, transform: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.push(Handler::Proxy {
            transform: Some(Arc::new(move |p| Ok(transform(p)))),
            description: None,
        })
    }

    pub fn delay(self, duration: Duration) -> Self {
        self.push(Handler::Delay {
            delay: Delay::Fixed(duration),
            description: None,
        })
    }

    pub fn delay_range(self, min: Duration, max: Duration) -> Self {
        self.push(Handler::Delay {
            delay: Delay::Range { min, max },
            description: None,
        })
    }

    pub fn delay_with<F>(self, compute: F) -> Self
    where
        F: Fn(&Value) -> Duration + Send + Sync + 'static,
    {
        self.push(Handler::Delay {
            delay: Delay::Computed(Arc::new(compute)),
            description: None,
        })
    }

    pub fn drop(self) -> Self {
        self.push(Handler::Drop { description: None })
    }

    pub fn link(self, id: impl Into<String>) -> Self {
        self.push(Handler::Link {
            id: id.into(),
            description: None,
        })
    }

    /// Describe the most recently added handler. Used in failure messages.
    /// With no handler yet, describes the step instead.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        match self.handlers.last_mut() {
            Some(handler) => handler.set_description(text.into()),
            None => self.description = Some(text.into()),
        }
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Only match messages accepted by `predicate`.
    pub fn where_payload<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.payload_matcher = PayloadMatcher::Predicate(Arc::new(predicate));
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.payload_matcher = PayloadMatcher::TraceId(trace_id.into());
        self
    }

    /// For hooks, bounds the handler chain. For waits, bounds the wait.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn component(&self) -> &Arc<dyn Component> {
        &self.component
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    pub fn matcher(&self) -> &MessageMatcher {
        &self.matcher
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn step_description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Wait deadline, if one was set explicitly.
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.mode {
            StepMode::Wait => self.timeout,
            _ => None,
        }
    }

    /// Produce the hook record. Wait builders also return the receiver
    /// that resolves on the first matching message.
    pub fn build(&self, scope: HookScope) -> (Hook, Option<oneshot::Receiver<WaitResult>>) {
        let mut hook = Hook::new(scope, self.matcher.clone())
            .with_direction(self.direction)
            .with_payload_matcher(self.payload_matcher.clone());
        hook.handlers = self.handlers.clone();
        hook.description = self.description.clone();

        match self.mode {
            StepMode::Wait => {
                let (waiter, rx) = Waiter::channel();
                hook.waiter = Some(waiter);
                (hook, Some(rx))
            }
            _ => {
                hook.timeout = self.timeout;
                (hook, None)
            }
        }
    }

    /// Register immediately with scenario scope. The hook survives every
    /// test case cleanup.
    pub fn register_persistent(self) -> String {
        let (hook, _) = self.build(HookScope::Scenario);
        self.component.registry().register_hook(hook)
    }
}

impl std::fmt::Debug for HookBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBuilder")
            .field("component", &self.component.name())
            .field("mode", &self.mode)
            .field("matcher", &self.matcher)
            .field("direction", &self.direction)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// Entry points for declaring steps against a component.
///
/// `on_message`/`wait_message` observe traffic flowing into the component
/// (downstream); `on_event`/`wait_event` observe traffic coming back from
/// its peer (upstream).
pub trait HookTarget {
    fn on_message(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder;

    fn on_event(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder;

    fn wait_message(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder;

    fn wait_event(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder;

    /// An action step run against this component in phase 2.
    fn action<F, Fut>(&self, description: impl Into<String>, action: F) -> Step
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static;
}

impl<C: Component + 'static> HookTarget for Arc<C> {
    fn on_message(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder {
        HookBuilder::new(self.clone(), matcher, Direction::Downstream)
    }

    fn on_event(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder {
        HookBuilder::new(self.clone(), matcher, Direction::Upstream)
    }

    fn wait_message(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder {
        HookBuilder::wait(self.clone(), matcher, Direction::Downstream)
    }

    fn wait_event(&self, matcher: impl Into<MessageMatcher>) -> HookBuilder {
        HookBuilder::wait(self.clone(), matcher, Direction::Upstream)
    }

    fn action<F, Fut>(&self, description: impl Into<String>, action: F) -> Step
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Step::action(self.clone(), description, action)
    }
}
