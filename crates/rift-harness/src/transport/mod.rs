//! Transport contracts consumed by the interception core.
//!
//! The core never touches wire formats. A transport adapter hands out
//! [`ConnectionHandle`]s: the connection itself plus the channel on which its
//! events arrive. Events are buffered in the channel, so a message that lands
//! between accept and handler attachment is never lost.
//!
//! ## Module Structure
//!
//! - `memory`: in-process transport for tests and embedding
//! - `tcp`: newline-delimited JSON over TCP, optionally TLS
//! - `tls`: certificate loading and connector/acceptor construction
//! - `network`: listener socket creation

mod memory;
mod network;
mod tcp;
mod tls;

use crate::config::{ListenConfig, TargetConfig};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::{MemoryConnection, MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConnection, TcpTransport};
pub use tls::{create_tls_acceptor, create_tls_connector, NoVerifier};

pub type TransportResult<T> = Result<T, TransportError>;

/// Something that happened on a connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message(Message),
    Error(TransportError),
    /// Emitted at most once, after which no further events arrive.
    Closed,
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Minimal transport-level connection.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> TransportResult<()>;
}

/// A connection together with its event stream.
pub struct ConnectionHandle {
    pub connection: Arc<dyn Connection>,
    pub events: ConnectionEvents,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Stream of accepted inbound connections.
pub type Incoming = mpsc::UnboundedReceiver<ConnectionHandle>;

/// Listener and dialer contract. One transport instance backs one component.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_server(&self, listen: &ListenConfig) -> TransportResult<Incoming>;

    /// Stop accepting and close every accepted connection.
    async fn stop_server(&self) -> TransportResult<()>;

    async fn connect(&self, target: &TargetConfig) -> TransportResult<ConnectionHandle>;

    async fn dispose(&self) -> TransportResult<()> {
        self.stop_server().await
    }
}
