//! Core AsyncServer struct and session routing.

use super::session::{OutboundState, Session};
use super::types::{ConnectFailure, ServerMode};
use crate::component::{Component, ComponentState, Lifecycle};
use crate::config::{ServerConfig, TargetConfig};
use crate::error::HarnessError;
use crate::hook::{Direction, HookOutcome, HookRegistry};
use crate::message::Message;
use crate::race::race;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionHandle, Incoming, Transport,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ServerInner {
    name: String,
    mode: ServerMode,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    lifecycle: Lifecycle,
    registry: HookRegistry,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    connect_failures: Mutex<Vec<ConnectFailure>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Inbound events of one session. Messages that arrive while a forward
/// waits for the outbound connect are held back and replayed in order.
struct InboundQueue {
    events: ConnectionEvents,
    backlog: VecDeque<Message>,
}

impl InboundQueue {
    fn new(events: ConnectionEvents) -> Self {
        Self {
            events,
            backlog: VecDeque::new(),
        }
    }

    async fn next(&mut self) -> Option<ConnectionEvent> {
        if let Some(message) = self.backlog.pop_front() {
            return Some(ConnectionEvent::Message(message));
        }
        self.events.recv().await
    }

    /// Wait for the session's connect attempt while still watching the
    /// client. `None` means the client closed first.
    async fn await_outbound(
        &mut self,
        session: &Session,
    ) -> Option<Option<Arc<dyn Connection>>> {
        loop {
            tokio::select! {
                outbound = session.outbound() => return Some(outbound),
                event = self.events.recv() => match event {
                    Some(ConnectionEvent::Message(message)) => self.backlog.push_back(message),
                    Some(ConnectionEvent::Error(e)) => {
                        debug!("Session {} inbound error while connecting: {}", session.id, e)
                    }
                    Some(ConnectionEvent::Closed) | None => return None,
                },
            }
        }
    }
}

/// Mock or proxy server component.
///
/// Every inbound connection becomes a session. Messages from the client run
/// through the hook registry as `Downstream`; a mock reply goes straight
/// back, anything else is forwarded to the session's outbound connection in
/// proxy mode. Backend events run as `Upstream` and go back to the client.
pub struct AsyncServer {
    inner: Arc<ServerInner>,
}

impl AsyncServer {
    pub fn new(
        name: impl Into<String>,
        config: ServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, HarnessError> {
        config
            .validate()
            .map_err(|e| HarnessError::Config(e.to_string()))?;
        let name = name.into();
        Ok(Self {
            inner: Arc::new(ServerInner {
                mode: ServerMode::from_config(&config),
                lifecycle: Lifecycle::new(name.clone()),
                registry: HookRegistry::new(name.clone()),
                name,
                config,
                transport,
                sessions: RwLock::new(HashMap::new()),
                connect_failures: Mutex::new(Vec::new()),
                accept_task: Mutex::new(None),
            }),
        })
    }

    pub fn mode(&self) -> &ServerMode {
        &self.inner.mode
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.read().keys().cloned().collect()
    }

    pub fn connect_failures(&self) -> Vec<ConnectFailure> {
        self.inner.connect_failures.lock().clone()
    }

    /// Send a message to one session's client, bypassing hooks.
    pub async fn send_to(&self, session_id: &str, message: Message) -> Result<(), HarnessError> {
        let session = self
            .inner
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| HarnessError::SessionNotFound(session_id.to_string()))?;
        session.inbound.send(message).await?;
        Ok(())
    }

    /// Send to every connected client in parallel. A failed send does not
    /// affect the others. Returns how many sends succeeded.
    pub async fn broadcast(&self, message: Message) -> usize {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        let sends = sessions.iter().map(|session| {
            let message = message.clone();
            async move {
                match session.inbound.send(message).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(
                            "[{}] Broadcast to session {} failed: {}",
                            self.inner.name, session.id, e
                        );
                        false
                    }
                }
            }
        });
        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }
}

impl ServerInner {
    fn accept(self: &Arc<Self>, handle: ConnectionHandle) {
        let ConnectionHandle { connection, events } = handle;
        let session = Session::new(connection, self.mode.is_proxy());
        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));
        info!("[{}] Session {} opened", self.name, session.id);

        if let ServerMode::Proxy { ref target } = self.mode {
            let task = tokio::spawn(Arc::clone(self).establish_outbound(
                Arc::clone(&session),
                target.clone(),
            ));
            session.track(task);
        }

        let task = tokio::spawn(Arc::clone(self).run_inbound(Arc::clone(&session), events));
        session.track(task);
    }

    /// The session's one and only connect attempt.
    async fn establish_outbound(self: Arc<Self>, session: Arc<Session>, target: TargetConfig) {
        let limit = self.config.proxy_connection_timeout();
        let error = match race(self.transport.connect(&target), limit).await {
            Ok(Ok(ConnectionHandle { connection, events })) => {
                session.set_outbound(OutboundState::Connected(Arc::clone(&connection)));
                let gone = !self.sessions.read().contains_key(&session.id)
                    || !session.inbound.is_connected();
                if gone {
                    // Client left while we were connecting.
                    let _ = connection.close().await;
                    return;
                }
                debug!(
                    "[{}] Session {} connected to {}",
                    self.name, session.id, target.address
                );
                let task = tokio::spawn(Arc::clone(&self).run_outbound(Arc::clone(&session), events));
                session.track(task);
                return;
            }
            Ok(Err(e)) => HarnessError::from(e),
            Err(_) => HarnessError::ConnectTimeout {
                target: target.address.clone(),
                timeout_ms: limit.as_millis() as u64,
            },
        };

        warn!(
            "[{}] Session {}: outbound connection to {} failed: {}",
            self.name, session.id, target.address, error
        );
        self.connect_failures.lock().push(ConnectFailure {
            session_id: session.id.clone(),
            target: target.address.clone(),
            error: error.to_string(),
            recorded_at: Utc::now(),
        });
        session.set_outbound(OutboundState::Failed);
        self.teardown_session(&session.id).await;
    }

    async fn run_inbound(self: Arc<Self>, session: Arc<Session>, events: ConnectionEvents) {
        let mut inbound = InboundQueue::new(events);
        while let Some(event) = inbound.next().await {
            match event {
                ConnectionEvent::Message(message) => {
                    if !self.handle_inbound(&session, message, &mut inbound).await {
                        debug!(
                            "[{}] Session {}: client left while connecting",
                            self.name, session.id
                        );
                        break;
                    }
                }
                ConnectionEvent::Error(e) => {
                    warn!("[{}] Session {} inbound error: {}", self.name, session.id, e)
                }
                ConnectionEvent::Closed => break,
            }
        }
        self.teardown_session(&session.id).await;
    }

    /// Returns false once the client is known to be gone.
    async fn handle_inbound(
        &self,
        session: &Session,
        message: Message,
        inbound: &mut InboundQueue,
    ) -> bool {
        let message_type = message.message_type.clone();
        match self
            .registry
            .execute_hooks(message, Direction::Downstream)
            .await
        {
            Ok(HookOutcome::Reply(reply)) => {
                if let Err(e) = session.inbound.send(reply).await {
                    debug!(
                        "[{}] Session {}: reply to '{}' not delivered: {}",
                        self.name, session.id, message_type, e
                    );
                }
            }
            Ok(HookOutcome::Forward(message)) => {
                if !self.mode.is_proxy() {
                    debug!(
                        "[{}] No mock reply for '{}' on session {}",
                        self.name, message_type, session.id
                    );
                    return true;
                }
                // A failed connect tears the session down on its own.
                let Some(outbound) = inbound.await_outbound(session).await else {
                    return false;
                };
                match outbound {
                    Some(outbound) if session.inbound.is_connected() => {
                        if let Err(e) = outbound.send(message).await {
                            debug!(
                                "[{}] Session {}: forward of '{}' failed: {}",
                                self.name, session.id, message_type, e
                            );
                        }
                    }
                    Some(_) => return false,
                    None => debug!(
                        "[{}] Session {}: '{}' not forwarded, no outbound connection",
                        self.name, session.id, message_type
                    ),
                }
            }
            Ok(HookOutcome::Dropped) => {}
            // Already recorded as unhandled by the registry.
            Err(_) => {}
        }
        true
    }

    async fn run_outbound(self: Arc<Self>, session: Arc<Session>, mut events: ConnectionEvents) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(message) => {
                    self.handle_outbound(&session, message).await
                }
                ConnectionEvent::Error(e) => {
                    warn!("[{}] Session {} outbound error: {}", self.name, session.id, e)
                }
                ConnectionEvent::Closed => break,
            }
        }
        self.teardown_session(&session.id).await;
    }

    async fn handle_outbound(&self, session: &Session, message: Message) {
        let message_type = message.message_type.clone();
        let result = match self.registry.execute_hooks(message, Direction::Upstream).await {
            Ok(HookOutcome::Forward(event)) if session.inbound.is_connected() => {
                session.inbound.send(event).await
            }
            Ok(HookOutcome::Reply(reply)) => match session.current_outbound() {
                Some(outbound) => outbound.send(reply).await,
                None => Ok(()),
            },
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!(
                "[{}] Session {}: upstream '{}' not delivered: {}",
                self.name, session.id, message_type, e
            );
        }
    }

    /// Close both sides of a session. Only the first caller does any work.
    async fn teardown_session(&self, session_id: &str) {
        let Some(session) = self.sessions.write().remove(session_id) else {
            return;
        };
        if let Some(outbound) = session.current_outbound() {
            let _ = outbound.close().await;
        }
        let _ = session.inbound.close().await;
        info!("[{}] Session {} closed", self.name, session_id);
    }

    fn spawn_accept_loop(self: &Arc<Self>, mut incoming: Incoming) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(handle) = incoming.recv().await {
                inner.accept(handle);
            }
            debug!("[{}] Accept loop finished", inner.name);
        });
        *self.accept_task.lock() = Some(task);
    }

    async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

        // Never close a session mid-handshake.
        join_all(sessions.iter().map(|s| s.settled())).await;

        for session in &sessions {
            if let Some(outbound) = session.current_outbound() {
                if let Err(e) = outbound.close().await {
                    warn!(
                        "[{}] Error closing outbound of session {}: {}",
                        self.name, session.id, e
                    );
                }
            }
        }
        if let Err(e) = self.transport.stop_server().await {
            warn!("[{}] Error stopping listener: {}", self.name, e);
        }
        for session in &sessions {
            let _ = session.inbound.close().await;
        }

        self.sessions.write().clear();
        self.registry.clear();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for session in &sessions {
            session.abort_tasks();
        }
    }
}

#[async_trait]
impl Component for AsyncServer {
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

        match inner.transport.start_server(&inner.config.listen).await {
            Ok(incoming) => {
                inner.spawn_accept_loop(incoming);
                inner.lifecycle.transition(ComponentState::Started)?;
                match inner.mode {
                    ServerMode::Mock => {
                        info!("[{}] Mock server listening on {}", inner.name, inner.config.listen.address)
                    }
                    ServerMode::Proxy { ref target } => info!(
                        "[{}] Proxy listening on {} -> {}",
                        inner.name, inner.config.listen.address, target.address
                    ),
                }
                Ok(())
            }
            Err(e) => {
                inner.lifecycle.transition(ComponentState::Error)?;
                Err(e.into())
            }
        }
    }

    async fn stop(&self) -> Result<(), HarnessError> {
        if !self.inner.lifecycle.begin_stop()? {
            return Ok(());
        }
        self.inner.shutdown().await;
        self.inner.lifecycle.transition(ComponentState::Stopped)?;
        info!("[{}] Stopped", self.inner.name);
        Ok(())
    }
}
