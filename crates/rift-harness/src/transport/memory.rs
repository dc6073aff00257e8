//! In-process transport.
//!
//! A [`MemoryNetwork`] is a registry of listeners keyed by address. Every
//! component gets its own [`MemoryTransport`] bound to a shared network, so
//! servers, proxies and clients talk to each other without sockets. The
//! network also counts connect attempts per address and can delay them,
//! which makes connection-establishment races observable in tests.

use super::{
    Connection, ConnectionEvent, ConnectionHandle, Incoming, Transport, TransportResult,
};
use crate::config::{ListenConfig, TargetConfig};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

struct ListenerEntry {
    incoming: mpsc::UnboundedSender<ConnectionHandle>,
    accepted: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: RwLock<HashMap<String, ListenerEntry>>,
    connect_attempts: RwLock<HashMap<String, usize>>,
    connect_delays: RwLock<HashMap<String, Duration>>,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh transport attached to this network.
    pub fn transport(&self) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(self.clone()))
    }

    /// Delay every future connect to `address` by `delay` before it resolves.
    pub fn set_connect_delay(&self, address: impl Into<String>, delay: Duration) {
        self.inner
            .connect_delays
            .write()
            .insert(address.into(), delay);
    }

    /// Number of connect attempts made to `address` so far.
    pub fn connect_attempts(&self, address: &str) -> usize {
        self.inner
            .connect_attempts
            .read()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_listening(&self, address: &str) -> bool {
        self.inner.listeners.read().contains_key(address)
    }

    /// Open connections accepted by the listener on `address`.
    pub fn open_connections(&self, address: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(address)
            .map(|entry| {
                entry
                    .accepted
                    .lock()
                    .iter()
                    .filter(|c| c.is_connected())
                    .count()
            })
            .unwrap_or(0)
    }

    fn bind(&self, address: &str) -> TransportResult<Incoming> {
        let mut listeners = self.inner.listeners.write();
        if listeners.contains_key(address) {
            return Err(TransportError::AddressInUse(address.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(
            address.to_string(),
            ListenerEntry {
                incoming: tx,
                accepted: Arc::new(Mutex::new(Vec::new())),
            },
        );
        Ok(rx)
    }

    fn unbind(&self, address: &str) -> Vec<Arc<MemoryConnection>> {
        match self.inner.listeners.write().remove(address) {
            Some(entry) => std::mem::take(&mut *entry.accepted.lock()),
            None => Vec::new(),
        }
    }

    async fn dial(&self, address: &str) -> TransportResult<ConnectionHandle> {
        *self
            .inner
            .connect_attempts
            .write()
            .entry(address.to_string())
            .or_insert(0) += 1;

        let delay = self.inner.connect_delays.read().get(address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (client, server) = MemoryConnection::pair();
        let listeners = self.inner.listeners.read();
        let entry = listeners
            .get(address)
            .ok_or_else(|| TransportError::ConnectionRefused(address.to_string()))?;

        {
            let mut accepted = entry.accepted.lock();
            accepted.retain(|c| c.is_connected());
            accepted.push(Arc::clone(&server.0));
        }
        entry
            .incoming
            .send(ConnectionHandle {
                connection: server.0,
                events: server.1,
            })
            .map_err(|_| TransportError::ConnectionRefused(address.to_string()))?;

        debug!("Memory connection {} -> {}", client.0.id(), address);
        Ok(ConnectionHandle {
            connection: client.0,
            events: client.1,
        })
    }
}

/// One end of an in-memory duplex pipe.
#[derive(Debug)]
pub struct MemoryConnection {
    id: String,
    open: Arc<AtomicBool>,
    own_events: mpsc::UnboundedSender<ConnectionEvent>,
    peer_events: mpsc::UnboundedSender<ConnectionEvent>,
}

type End = (Arc<MemoryConnection>, super::ConnectionEvents);

impl MemoryConnection {
    /// Create both ends of a pipe. Closing either end closes both.
    pub fn pair() -> (End, End) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Arc::new(MemoryConnection {
            id: uuid::Uuid::new_v4().to_string(),
            open: Arc::clone(&open),
            own_events: a_tx.clone(),
            peer_events: b_tx.clone(),
        });
        let b = Arc::new(MemoryConnection {
            id: uuid::Uuid::new_v4().to_string(),
            open,
            own_events: b_tx,
            peer_events: a_tx,
        });
        ((a, a_rx), (b, b_rx))
    }

    /// Deliver a transport error to this end's event stream.
    pub fn inject_error(&self, error: TransportError) {
        let _ = self.own_events.send(ConnectionEvent::Error(error));
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.id.clone()));
        }
        self.peer_events
            .send(ConnectionEvent::Message(message))
            .map_err(|_| TransportError::NotConnected(self.id.clone()))
    }

    async fn close(&self) -> TransportResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.own_events.send(ConnectionEvent::Closed);
            let _ = self.peer_events.send(ConnectionEvent::Closed);
        }
        Ok(())
    }
}

/// Per-component handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    bound: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        Self {
            network,
            bound: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start_server(&self, listen: &ListenConfig) -> TransportResult<Incoming> {
        let incoming = self.network.bind(&listen.address)?;
        *self.bound.lock() = Some(listen.address.clone());
        Ok(incoming)
    }

    async fn stop_server(&self) -> TransportResult<()> {
        let Some(address) = self.bound.lock().take() else {
            return Ok(());
        };
        for connection in self.network.unbind(&address) {
            let _ = connection.close().await;
        }
        Ok(())
    }

    async fn connect(&self, target: &TargetConfig) -> TransportResult<ConnectionHandle> {
        self.network.dial(&target.address).await
    }
}
