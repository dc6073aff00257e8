//! Newline-delimited JSON messages over TCP, optionally wrapped in TLS.
//!
//! Each line on the wire is one serialised [`Message`]. Malformed lines are
//! reported as [`ConnectionEvent::Error`] and skipped; the connection stays
//! open.

use super::network::create_listener;
use super::tls::{create_tls_acceptor, create_tls_connector, server_name};
use super::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionHandle, Incoming, Transport,
    TransportResult,
};
use crate::config::{ListenConfig, TargetConfig};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Upper bound on a single frame.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

type FramedIo = Framed<Box<dyn Io>, LinesCodec>;

fn codec_error(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::Io(io) => TransportError::Io(io),
        other => TransportError::Codec(other.to_string()),
    }
}

async fn resolve(address: &str) -> TransportResult<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?
        .next()
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))
}

/// A framed TCP (or TLS) connection.
pub struct TcpConnection {
    id: String,
    peer: SocketAddr,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    writer: tokio::sync::Mutex<SplitSink<FramedIo, String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TcpConnection {
    fn spawn<S>(io: S, peer: SocketAddr) -> (Arc<Self>, ConnectionEvents)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let io: Box<dyn Io> = Box::new(io);
        let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let (writer, mut reader) = framed.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let id = uuid::Uuid::new_v4().to_string();

        let task_events = events_tx.clone();
        let task_connected = Arc::clone(&connected);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => match serde_json::from_str::<Message>(&line) {
                        Ok(message) => {
                            if task_events.send(ConnectionEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = task_events.send(ConnectionEvent::Error(
                                TransportError::Codec(format!("invalid frame: {e}")),
                            ));
                        }
                    },
                    Err(e) => {
                        let _ = task_events.send(ConnectionEvent::Error(codec_error(e)));
                        break;
                    }
                }
            }
            if task_connected.swap(false, Ordering::SeqCst) {
                let _ = task_events.send(ConnectionEvent::Closed);
            }
            debug!("TCP connection {} reader finished", task_id);
        });

        let connection = Arc::new(TcpConnection {
            id,
            peer,
            connected,
            events: events_tx,
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(Some(handle)),
        });
        (connection, events_rx)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected(self.id.clone()));
        }
        let line = serde_json::to_string(&message)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.writer.lock().await.send(line).await.map_err(codec_error)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.writer.lock().await.close().await.map_err(codec_error);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let _ = self.events.send(ConnectionEvent::Closed);
        result
    }
}

struct ListenerState {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accepted: Arc<Mutex<Vec<Arc<TcpConnection>>>>,
    accept_task: JoinHandle<()>,
}

/// TCP transport. Listens on at most one address at a time.
#[derive(Default)]
pub struct TcpTransport {
    listener: Mutex<Option<ListenerState>>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().map(|state| state.local_addr)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_server(&self, listen: &ListenConfig) -> TransportResult<Incoming> {
        if self.listener.lock().is_some() {
            return Err(TransportError::AddressInUse(listen.address.clone()));
        }

        let addr = resolve(&listen.address).await?;
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let acceptor = match listen.tls {
            Some(ref tls) => Some(create_tls_acceptor(&tls.cert_path, &tls.key_path)?),
            None => None,
        };

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let accepted: Arc<Mutex<Vec<Arc<TcpConnection>>>> = Arc::new(Mutex::new(Vec::new()));

        let task_accepted = Arc::clone(&accepted);
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                let acceptor = acceptor.clone();
                                let incoming_tx = incoming_tx.clone();
                                let accepted = Arc::clone(&task_accepted);
                                tokio::spawn(async move {
                                    let (connection, events) = match acceptor {
                                        Some(acceptor) => match acceptor.accept(stream).await {
                                            Ok(tls_stream) => TcpConnection::spawn(tls_stream, peer),
                                            Err(err) => {
                                                error!("TLS handshake failed from {}: {}", peer, err);
                                                return;
                                            }
                                        },
                                        None => TcpConnection::spawn(stream, peer),
                                    };
                                    {
                                        let mut accepted = accepted.lock();
                                        accepted.retain(|c| c.is_connected());
                                        accepted.push(Arc::clone(&connection));
                                    }
                                    let handle = ConnectionHandle {
                                        connection: connection.clone(),
                                        events,
                                    };
                                    if incoming_tx.send(handle).is_err() {
                                        let _ = connection.close().await;
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error on {}: {}", local_addr, e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Listener on {} shutting down", local_addr);
                        break;
                    }
                }
            }
        });

        info!("Listening on tcp://{}", local_addr);
        *self.listener.lock() = Some(ListenerState {
            local_addr,
            shutdown_tx,
            accepted,
            accept_task,
        });
        Ok(incoming_rx)
    }

    async fn stop_server(&self) -> TransportResult<()> {
        let Some(state) = self.listener.lock().take() else {
            return Ok(());
        };
        let _ = state.shutdown_tx.send(());
        state.accept_task.abort();

        let connections = std::mem::take(&mut *state.accepted.lock());
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!("Error closing connection {}: {}", connection.id(), e);
            }
        }
        Ok(())
    }

    async fn connect(&self, target: &TargetConfig) -> TransportResult<ConnectionHandle> {
        let addr = resolve(&target.address).await?;
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportError::ConnectionRefused(target.address.clone())
            } else {
                TransportError::Io(e)
            }
        })?;
        let _ = stream.set_nodelay(true);

        let (connection, events) = match target.tls {
            Some(ref tls) => {
                let connector = create_tls_connector(tls)?;
                let name = server_name(tls, target.host())?;
                let tls_stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                TcpConnection::spawn(tls_stream, addr)
            }
            None => TcpConnection::spawn(stream, addr),
        };

        debug!("Connected to tcp://{} ({})", addr, connection.id());
        Ok(ConnectionHandle { connection, events })
    }
}
