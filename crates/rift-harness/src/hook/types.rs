//! Hook records and their matchers.

use super::catch_panic;
use super::endpoint::{looks_like_endpoint, EndpointPattern};
use super::handler::Handler;
use crate::message::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Who owns a hook, and therefore when it is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookScope {
    /// Registered during scenario init; survives every test case.
    Scenario,
    /// Removed when the named test case finishes.
    TestCase(String),
}

impl HookScope {
    pub fn is_persistent(&self) -> bool {
        matches!(self, HookScope::Scenario)
    }

    pub fn test_case_id(&self) -> Option<&str> {
        match self {
            HookScope::Scenario => None,
            HookScope::TestCase(id) => Some(id),
        }
    }
}

/// Traffic direction through a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client towards backend (messages a server receives).
    Downstream,
    /// Backend towards client (events a client receives).
    Upstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downstream => f.write_str("downstream"),
            Direction::Upstream => f.write_str("upstream"),
        }
    }
}

/// Cheap first-level match on the message type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageMatcher {
    Any,
    Type(String),
    AnyOf(BTreeSet<String>),
    Endpoint(EndpointPattern),
}

impl MessageMatcher {
    pub fn any_of<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MessageMatcher::AnyOf(types.into_iter().map(Into::into).collect())
    }

    /// Parse a matcher string: endpoint patterns start with `/` (optionally
    /// after a method), everything else is an exact type.
    pub fn parse(pattern: &str) -> Self {
        if looks_like_endpoint(pattern) {
            if let Ok(endpoint) = EndpointPattern::parse(pattern) {
                return MessageMatcher::Endpoint(endpoint);
            }
        }
        MessageMatcher::Type(pattern.to_string())
    }

    pub fn matches(&self, message_type: &str) -> bool {
        match self {
            MessageMatcher::Any => true,
            MessageMatcher::Type(expected) => expected == message_type,
            MessageMatcher::AnyOf(types) => types.contains(message_type),
            MessageMatcher::Endpoint(pattern) => pattern.matches(message_type),
        }
    }

    /// Human readable form used in step results and timeout errors.
    pub fn label(&self) -> String {
        match self {
            MessageMatcher::Any => "*".to_string(),
            MessageMatcher::Type(t) => t.clone(),
            MessageMatcher::AnyOf(types) => types.iter().cloned().collect::<Vec<_>>().join("|"),
            MessageMatcher::Endpoint(pattern) => pattern.as_str().to_string(),
        }
    }
}

impl From<&str> for MessageMatcher {
    fn from(pattern: &str) -> Self {
        MessageMatcher::parse(pattern)
    }
}

impl From<String> for MessageMatcher {
    fn from(pattern: String) -> Self {
        MessageMatcher::parse(&pattern)
    }
}

impl<const N: usize> From<[&str; N]> for MessageMatcher {
    fn from(types: [&str; N]) -> Self {
        MessageMatcher::any_of(types)
    }
}

impl From<EndpointPattern> for MessageMatcher {
    fn from(pattern: EndpointPattern) -> Self {
        MessageMatcher::Endpoint(pattern)
    }
}

pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Second-level match, only evaluated once the type matched.
#[derive(Clone, Default)]
pub enum PayloadMatcher {
    #[default]
    None,
    TraceId(String),
    Predicate(MessagePredicate),
}

impl fmt::Debug for PayloadMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadMatcher::None => f.write_str("None"),
            PayloadMatcher::TraceId(id) => f.debug_tuple("TraceId").field(id).finish(),
            PayloadMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl PayloadMatcher {
    /// A panicking predicate counts as no match.
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            PayloadMatcher::None => true,
            PayloadMatcher::TraceId(id) => message.trace_id.as_deref() == Some(id.as_str()),
            PayloadMatcher::Predicate(predicate) => {
                catch_panic(|| predicate(message)).unwrap_or(false)
            }
        }
    }
}

/// What a wait step receives: the observed message, or the chain's error.
pub type WaitResult = Result<Message, String>;

/// One-shot resolver for wait hooks. Resolves at most once; later matches and
/// late results are ignored.
#[derive(Clone)]
pub(crate) struct Waiter(Arc<Mutex<Option<oneshot::Sender<WaitResult>>>>);

impl Waiter {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<WaitResult>) {
        let (tx, rx) = oneshot::channel();
        (Self(Arc::new(Mutex::new(Some(tx)))), rx)
    }

    pub(crate) fn resolve(&self, result: WaitResult) -> bool {
        match self.0.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// A registered message interceptor.
pub struct Hook {
    pub id: String,
    pub scope: HookScope,
    pub matcher: MessageMatcher,
    pub payload_matcher: PayloadMatcher,
    pub handlers: Vec<Handler>,
    /// Upper bound on running the handler chain
    pub timeout: Option<Duration>,
    /// `None` matches both directions
    pub direction: Option<Direction>,
    pub description: Option<String>,
    pub(crate) waiter: Option<Waiter>,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("matcher", &self.matcher)
            .field("payload_matcher", &self.payload_matcher)
            .field("handlers", &self.handlers.len())
            .field("direction", &self.direction)
            .field("wait", &self.waiter.is_some())
            .finish()
    }
}

impl Hook {
    pub fn new(scope: HookScope, matcher: impl Into<MessageMatcher>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            matcher: matcher.into(),
            payload_matcher: PayloadMatcher::None,
            handlers: Vec::new(),
            timeout: None,
            direction: None,
            description: None,
            waiter: None,
        }
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_payload_matcher(mut self, payload_matcher: PayloadMatcher) -> Self {
        self.payload_matcher = payload_matcher;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_wait(&self) -> bool {
        self.waiter.is_some()
    }

    /// Two-level match: direction and type first, payload only if those pass.
    pub fn accepts(&self, message: &Message, direction: Direction) -> bool {
        if self.direction.is_some_and(|d| d != direction) {
            return false;
        }
        let type_matched =
            catch_panic(|| self.matcher.matches(&message.message_type)).unwrap_or(false);
        type_matched && self.payload_matcher.matches(message)
    }

    pub(crate) fn resolve_waiter(&self, result: WaitResult) {
        if let Some(ref waiter) = self.waiter {
            waiter.resolve(result);
        }
    }
}
