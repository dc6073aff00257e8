//! Client component.
//!
//! Connects to a target on start and keeps a log of what it received. Outgoing
//! messages run through the registry as `Downstream`, incoming ones as
//! `Upstream`, so the same hook surface works on both ends of a conversation.

use crate::component::{Component, ComponentState, Lifecycle};
use crate::config::ClientConfig;
use crate::error::HarnessError;
use crate::hook::{Direction, HookOutcome, HookRegistry, HookTarget};
use crate::message::Message;
use crate::race::race;
use crate::step::Step;
use crate::transport::{Connection, ConnectionEvent, ConnectionEvents, Transport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ClientInner {
    name: String,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Lifecycle,
    registry: HookRegistry,
    connection: RwLock<Option<Arc<dyn Connection>>>,
    received: Mutex<Vec<Message>>,
    arrivals: Notify,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, HarnessError> {
        config
            .validate()
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        let name = name.into();
        Ok(Self {
            inner: Arc::new(ClientInner {
                lifecycle: Lifecycle::new(name.clone()),
                registry: HookRegistry::new(name.clone()),
                name,
                config,
                transport,
                connection: RwLock::new(None),
                received: Mutex::new(Vec::new()),
                arrivals: Notify::new(),
                event_task: Mutex::new(None),
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .read()
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Messages that made it through the upstream hooks, oldest first.
    pub fn received(&self) -> Vec<Message> {
        self.inner.received.lock().clone()
    }

    pub fn received_of(&self, message_type: &str) -> Vec<Message> {
        self.inner
            .received
            .lock()
            .iter()
            .filter(|m| m.message_type == message_type)
            .cloned()
            .collect()
    }

    pub fn clear_received(&self) {
        self.inner.received.lock().clear();
    }

    /// The oldest received message of `message_type`, waiting for one to
    /// arrive if none has. Messages are not consumed.
    pub async fn first_of(&self, message_type: &str) -> Message {
        loop {
            let notified = self.inner.arrivals.notified();
            if let Some(message) = self
                .inner
                .received
                .lock()
                .iter()
                .find(|m| m.message_type == message_type)
                .cloned()
            {
                return message;
            }
            notified.await;
        }
    }

    /// Run `message` through the downstream hooks and send what is left.
    pub async fn send(&self, message: Message) -> Result<(), HarnessError> {
        let connection = self.inner.current_connection()?;
        match self
            .inner
            .registry
            .execute_hooks(message, Direction::Downstream)
            .await?
        {
            HookOutcome::Forward(message) => connection.send(message).await?,
            // Answered locally, as if it came from the peer.
            HookOutcome::Reply(reply) => self.inner.handle_incoming(reply).await,
            HookOutcome::Dropped => {}
        }
        Ok(())
    }

    /// An action step that sends `message`.
    pub fn send_step(self: &Arc<Self>, message: Message) -> Step {
        let client = Arc::clone(self);
        let description = format!("send '{}'", message.message_type);
        self.action(description, move || async move {
            client.send(message).await?;
            Ok(())
        })
    }
}

impl ClientInner {
    fn current_connection(&self) -> Result<Arc<dyn Connection>, HarnessError> {
        self.connection
            .read()
            .clone()
            .filter(|c| c.is_connected())
            .ok_or_else(|| HarnessError::NotStarted(self.name.clone()))
    }

    async fn handle_incoming(&self, message: Message) {
        match self
            .registry
            .execute_hooks(message, Direction::Upstream)
            .await
        {
            Ok(HookOutcome::Forward(message)) => {
                debug!("[{}] Received '{}'", self.name, message.message_type);
                self.received.lock().push(message);
                self.arrivals.notify_waiters();
            }
            Ok(HookOutcome::Reply(reply)) => {
                let connection = self.connection.read().clone();
                if let Some(connection) = connection {
                    if let Err(e) = connection.send(reply).await {
                        debug!("[{}] Reply not delivered: {}", self.name, e);
                    }
                }
            }
            Ok(HookOutcome::Dropped) | Err(_) => {}
        }
    }

    async fn run_events(self: Arc<Self>, mut events: ConnectionEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(message) => self.handle_incoming(message).await,
                ConnectionEvent::Error(e) => warn!("[{}] Connection error: {}", self.name, e),
                ConnectionEvent::Closed => {
                    info!("[{}] Connection closed", self.name);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Component for Client {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> ComponentState {
        self.inner.lifecycle.state()
    }

    fn registry(&self) -> &HookRegistry {
        &self.inner.registry
    }

    async fn start(&self) -> Result<(), HarnessError> {
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;

        let target = &inner.config.target;
        let limit = inner.config.connect_timeout();
        let handle = match race(inner.transport.connect(target), limit).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                inner.lifecycle.transition(ComponentState::Error)?;
                return Err(e.into());
            }
            Err(_) => {
                inner.lifecycle.transition(ComponentState::Error)?;
                return Err(HarnessError::ConnectTimeout {
                    target: target.address.clone(),
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        };

        *inner.connection.write() = Some(Arc::clone(&handle.connection));
        let task = tokio::spawn(Arc::clone(inner).run_events(handle.events));
        *inner.event_task.lock() = Some(task);
        inner.lifecycle.transition(ComponentState::Started)?;
        info!("[{}] Connected to {}", inner.name, target.address);
        Ok(())
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_stop()? {
            return Ok(());
        }
        let connection = inner.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("[{}] Error closing connection: {}", inner.name, e);
            }
        }
        if let Some(task) = inner.event_task.lock().take() {
            task.abort();
        }
        inner.lifecycle.transition(ComponentState::Stopped)?;
        info!("[{}] Stopped", inner.name);
        Ok(())
    }
}
