//! Handler variants and their execution.

use super::catch_panic;
use crate::error::HookError;
use crate::message::Message;
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type PayloadFn = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;
pub type PayloadCheck = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type DelayFn = Arc<dyn Fn(&Value) -> Duration + Send + Sync>;

/// How long a `Delay` handler sleeps.
#[derive(Clone)]
pub enum Delay {
    Fixed(Duration),
    /// Uniformly random between `min` and `max` inclusive
    Range { min: Duration, max: Duration },
    Computed(DelayFn),
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Delay::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Delay::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl Delay {
    pub fn duration_for(&self, payload: &Value) -> Duration {
        match self {
            Delay::Fixed(d) => *d,
            Delay::Range { min, max } => {
                if max <= min {
                    return *min;
                }
                let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
                Duration::from_millis(ms as u64)
            }
            Delay::Computed(f) => f(payload),
        }
    }
}

/// One step of a hook's processing chain.
#[derive(Clone)]
pub enum Handler {
    Assert {
        check: PayloadCheck,
        description: Option<String>,
    },
    Transform {
        transform: PayloadFn,
        description: Option<String>,
    },
    MockEvent {
        event_type: String,
        build: PayloadFn,
        description: Option<String>,
    },
    Proxy {
        transform: Option<PayloadFn>,
        description: Option<String>,
    },
    Delay {
        delay: Delay,
        description: Option<String>,
    },
    Drop {
        description: Option<String>,
    },
    Link {
        id: String,
        description: Option<String>,
    },
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(self.kind());
        match self {
            Handler::MockEvent { event_type, .. } => {
                s.field("event_type", event_type);
            }
            Handler::Delay { delay, .. } => {
                s.field("delay", delay);
            }
            Handler::Link { id, .. } => {
                s.field("id", id);
            }
            _ => {}
        }
        s.field("description", &self.description()).finish()
    }
}

/// Message in flight through a hook pipeline.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub message: Message,
    /// Set by `MockEvent`, cleared by `Proxy`
    pub reply: bool,
}

pub(crate) enum Flow {
    Continue,
    Dropped,
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Assert { .. } => "assert",
            Handler::Transform { .. } => "transform",
            Handler::MockEvent { .. } => "mockEvent",
            Handler::Proxy { .. } => "proxy",
            Handler::Delay { .. } => "delay",
            Handler::Drop { .. } => "drop",
            Handler::Link { .. } => "link",
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Handler::Assert { description, .. }
            | Handler::Transform { description, .. }
            | Handler::MockEvent { description, .. }
            | Handler::Proxy { description, .. }
            | Handler::Delay { description, .. }
            | Handler::Drop { description }
            | Handler::Link { description, .. } => description.as_deref(),
        }
    }

    pub(crate) fn set_description(&mut self, text: String) {
        match self {
            Handler::Assert { description, .. }
            | Handler::Transform { description, .. }
            | Handler::MockEvent { description, .. }
            | Handler::Proxy { description, .. }
            | Handler::Delay { description, .. }
            | Handler::Drop { description }
            | Handler::Link { description, .. } => *description = Some(text),
        }
    }

    fn describe(&self, message: &Message) -> String {
        self.description()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} on '{}'", self.kind(), message.message_type))
    }

    fn invoke(&self, hook: &str, f: &PayloadFn, message: &Message) -> Result<Value, HookError> {
        match catch_panic(|| f(&message.payload)) {
            Some(Ok(value)) => Ok(value),
            Some(Err(source)) => Err(HookError::Handler {
                hook: hook.to_string(),
                description: self.describe(message),
                source,
            }),
            None => Err(HookError::Panicked {
                hook: hook.to_string(),
                description: self.describe(message),
            }),
        }
    }

    /// Run this handler against the in-flight message.
    pub(crate) async fn apply(&self, hook: &str, state: &mut InFlight) -> Result<Flow, HookError> {
        match self {
            Handler::Assert { check, .. } => {
                let passed = catch_panic(|| check(&state.message.payload)).unwrap_or(false);
                if !passed {
                    return Err(HookError::AssertionFailed {
                        hook: hook.to_string(),
                        description: self.describe(&state.message),
                    });
                }
            }
            Handler::Transform { transform, .. } => {
                state.message.payload = self.invoke(hook, transform, &state.message)?;
            }
            Handler::MockEvent {
                event_type, build, ..
            } => {
                let payload = self.invoke(hook, build, &state.message)?;
                state.message = Message {
                    message_type: event_type.clone(),
                    payload,
                    trace_id: state.message.trace_id.clone(),
                };
                state.reply = true;
            }
            Handler::Proxy { transform, .. } => {
                if let Some(transform) = transform {
                    state.message.payload = self.invoke(hook, transform, &state.message)?;
                }
                state.reply = false;
            }
            Handler::Delay { delay, .. } => {
                let duration = catch_panic(|| delay.duration_for(&state.message.payload))
                    .ok_or_else(|| HookError::Panicked {
                        hook: hook.to_string(),
                        description: self.describe(&state.message),
                    })?;
                tokio::time::sleep(duration).await;
            }
            Handler::Drop { .. } => return Ok(Flow::Dropped),
            Handler::Link { id, .. } => {
                if state.message.trace_id.is_none() {
                    state.message.trace_id = Some(id.clone());
                }
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn in_flight(message_type: &str, payload: Value) -> InFlight {
        InFlight {
            message: Message::new(message_type, payload),
            reply: false,
        }
    }

    #[tokio::test]
    async fn test_mock_event_replaces_message_and_keeps_trace() {
        let handler = Handler::MockEvent {
            event_type: "Pong".to_string(),
            build: Arc::new(|p| Ok(json!({"seq": p["seq"]}))),
            description: None,
        };
        let mut state = in_flight("Ping", json!({"seq": 3}));
        state.message.trace_id = Some("t".to_string());

        assert!(matches!(
            handler.apply("h", &mut state).await,
            Ok(Flow::Continue)
        ));
        assert!(state.reply);
        assert_eq!(state.message.message_type, "Pong");
        assert_eq!(state.message.payload, json!({"seq": 3}));
        assert_eq!(state.message.trace_id.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_failed_assert_uses_description() {
        let handler = Handler::Assert {
            check: Arc::new(|p| p["ok"] == json!(true)),
            description: Some("payload must be ok".to_string()),
        };
        let mut state = in_flight("Check", json!({"ok": false}));
        let err = handler.apply("h1", &mut state).await.err().unwrap();
        assert_eq!(err.hook_id(), "h1");
        assert!(err.to_string().contains("payload must be ok"));
    }

    #[tokio::test]
    async fn test_panicking_transform_is_an_error() {
        let handler = Handler::Transform {
            transform: Arc::new(|_| panic!("boom")),
            description: None,
        };
        let mut state = in_flight("X", json!({}));
        let err = handler.apply("h", &mut state).await.err().unwrap();
        assert!(matches!(err, HookError::Panicked { .. }));
        assert!(err.to_string().contains("transform on 'X'"));
    }

    #[tokio::test]
    async fn test_proxy_clears_reply_and_link_sets_missing_trace() {
        let mut state = in_flight("Login", json!({"user": "bob"}));
        state.reply = true;

        Handler::Proxy {
            transform: None,
            description: None,
        }
        .apply("h", &mut state)
        .await
        .unwrap();
        assert!(!state.reply);

        let link = Handler::Link {
            id: "flow-1".to_string(),
            description: None,
        };
        link.apply("h", &mut state).await.unwrap();
        assert_eq!(state.message.trace_id.as_deref(), Some("flow-1"));

        state.message.trace_id = Some("existing".to_string());
        link.apply("h", &mut state).await.unwrap();
        assert_eq!(state.message.trace_id.as_deref(), Some("existing"));
    }

    #[test]
    fn test_delay_range_stays_in_bounds() {
        let delay = Delay::Range {
            min: Duration::from_millis(5),
            max: Duration::from_millis(10),
        };
        for _ in 0..50 {
            let d = delay.duration_for(&Value::Null);
            assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(10));
        }
        let inverted = Delay::Range {
            min: Duration::from_millis(7),
            max: Duration::from_millis(1),
        };
        assert_eq!(inverted.duration_for(&Value::Null), Duration::from_millis(7));
    }
}
