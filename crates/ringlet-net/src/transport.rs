//! TCP sessions and the inbound listener.
//!
//! A [`Session`] is one TCP connection with a reader task feeding a
//! [`Dispatcher`] and a writer task draining an outbound queue, so sending
//! never blocks the caller. [`Listener`] accepts inbound sessions and hands
//! them all to one dispatcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use ringlet_types::NodeAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::dispatch::{Dispatcher, ProtocolHandler};
use crate::error::NetError;
use crate::frame::Frame;
use crate::message::Protocol;

/// Process-unique session identifier.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// One TCP connection to a peer. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: SessionId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Connect to `addr` and start dispatching its messages to `handler`.
    pub async fn connect(
        addr: &NodeAddr,
        handler: Arc<dyn ProtocolHandler>,
        timeout: Duration,
    ) -> Result<Session, NetError> {
        debug!(%addr, "connecting to peer");
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| NetError::ConnectTimeout(addr.to_string()))?
        .map_err(|e| NetError::Connect(format!("{addr}: {e}")))?;

        Session::start(stream, Dispatcher::new(handler))
    }

    /// Wrap an established stream and spawn its reader and writer tasks.
    pub fn start(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> Result<Session, NetError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Session {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                peer,
                outbound,
                shutdown,
            }),
        };

        tokio::spawn(write_loop(
            session.id(),
            writer,
            outbound_rx,
            session.inner.shutdown.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(session.clone(), reader, dispatcher, shutdown_rx));

        debug!(session = session.id(), %peer, "session opened");
        Ok(session)
    }

    /// This session's identifier.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Remote socket address.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue a message for transmission.
    pub fn send(&self, protocol: &Protocol) -> Result<(), NetError> {
        self.send_frame(&protocol.to_frame())
    }

    /// Queue a raw frame for transmission.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), NetError> {
        let bytes = frame.encode()?;
        if self.is_closed() {
            return Err(NetError::SessionClosed);
        }
        self.inner
            .outbound
            .send(bytes)
            .map_err(|_| NetError::SessionClosed)
    }

    /// Close the connection. Pending outbound bytes may be dropped.
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Whether the session has been closed (locally or by the peer).
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow() || self.inner.outbound.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .finish_non_exhaustive()
    }
}

async fn write_loop(
    id: SessionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shutdown: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(bytes) = next else { break };
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!(session = id, %e, "write failed");
                    break;
                }
                trace!(session = id, len = bytes.len(), "wrote frame");
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
    shutdown.send_replace(true);
}

async fn read_loop(
    session: Session,
    mut reader: OwnedReadHalf,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let reason = loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break None,
                Ok(_) => {
                    let data = buf.split().freeze();
                    dispatcher.deliver(&session, data).await;
                    buf.reserve(READ_BUFFER_SIZE);
                }
                Err(e) => break Some(NetError::Io(e)),
            },
            _ = shutdown_rx.changed() => break None,
        }
    };

    session.close();
    match &reason {
        Some(e) => debug!(session = session.id(), peer = %session.peer(), %e, "session failed"),
        None => debug!(session = session.id(), peer = %session.peer(), "session closed"),
    }
    dispatcher.closed(&session, reason.as_ref()).await;
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accepts inbound sessions and dispatches all of them to one handler.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start accepting connections.
    pub async fn bind(addr: &str, handler: Arc<dyn ProtocolHandler>) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let sessions = Arc::new(Mutex::new(HashMap::new()));

        let task = tokio::spawn(accept_loop(
            listener,
            Dispatcher::new(handler),
            sessions.clone(),
            shutdown_rx,
        ));

        info!(%local_addr, "listening");
        Ok(Self {
            local_addr,
            shutdown,
            sessions,
            task,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open inbound sessions.
    pub fn session_count(&self) -> usize {
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        sessions.retain(|_, s| !s.is_closed());
        sessions.len()
    }

    /// Stop accepting and close every inbound session.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in sessions {
            session.close();
        }
        info!(local_addr = %self.local_addr, "listener stopped");
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<Mutex<HashMap<SessionId, Session>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => match Session::start(stream, dispatcher.clone()) {
                    Ok(session) => {
                        debug!(session = session.id(), %peer, "accepted session");
                        let mut sessions = sessions.lock().expect("sessions lock poisoned");
                        sessions.retain(|_, s| !s.is_closed());
                        sessions.insert(session.id(), session);
                    }
                    Err(e) => warn!(%peer, %e, "failed to start inbound session"),
                },
                Err(e) => {
                    warn!(%e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}
