//! Outbound connection to one sibling, with request queueing and
//! response correlation.
//!
//! Callers see a blocking contract: [`Connector::blocking_push`] and
//! [`Connector::blocking_pull`] return only once a response arrives or the
//! timeout expires. A timeout yields the same value as a negative answer.
//!
//! Requests submitted while the connection is still being established are
//! queued and drained strictly in FIFO order once it opens. A request that
//! cannot be encoded fails on its own. Any transport error kills the
//! connector: queued requests are failed, waiters are woken and the
//! observer receives a [`Failure`] per unsent request. A dead
//! connector never reconnects; the owner creates a fresh one on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ringlet_types::{Chunk, NodeAddr, RingHash};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::dispatch::ProtocolHandler;
use crate::error::NetError;
use crate::message::{Discover, Failure, Protocol, Pull, Push};
use crate::monitor::{MonitorRegistry, Reply};
use crate::transport::Session;

/// How long to wait for the TCP connection to open.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on concurrent drain tasks per connector.
pub const MAX_DRAIN_TASKS: usize = 1;

/// Reason attached to failures caused by the peer closing the connection.
pub const PEER_DISAPPEARED: &str = "peer disappeared";

/// Lifecycle of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Created, nothing submitted yet.
    Disconnected,
    /// Connection attempt in flight; requests are queued.
    Connecting,
    /// Session open; requests are drained as they arrive.
    Connected,
    /// Failed or disconnected. Terminal.
    Closed,
}

/// Receives events a connector cannot handle itself.
#[async_trait]
pub trait ConnectorObserver: Send + Sync {
    /// A response to a discovery request sent through `connector`.
    async fn discover_response(&self, connector: &Arc<Connector>, response: Discover);

    /// `connector` died. Called once per request that was still queued, or
    /// once with `original: None` when nothing was queued.
    async fn connector_failed(&self, connector: &Arc<Connector>, failure: Failure);
}

struct Inner {
    state: ConnectorState,
    session: Option<Session>,
    pending: VecDeque<Protocol>,
}

/// Per-sibling outbound connection owner.
pub struct Connector {
    remote: RingHash,
    addr: NodeAddr,
    observer: Weak<dyn ConnectorObserver>,
    this: Weak<Connector>,
    inner: Mutex<Inner>,
    monitors: Arc<MonitorRegistry>,
    next_sn: AtomicU64,
    drain_permits: Arc<Semaphore>,
}

impl Connector {
    /// Create a connector for the sibling at `addr`. No connection is made
    /// until the first request is submitted.
    pub fn new(remote: RingHash, addr: NodeAddr, observer: Weak<dyn ConnectorObserver>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            remote,
            addr,
            observer,
            this: this.clone(),
            inner: Mutex::new(Inner {
                state: ConnectorState::Disconnected,
                session: None,
                pending: VecDeque::new(),
            }),
            monitors: MonitorRegistry::new(),
            next_sn: AtomicU64::new(1),
            drain_permits: Arc::new(Semaphore::new(MAX_DRAIN_TASKS)),
        })
    }

    /// Ring position of the remote node.
    pub fn remote_hash(&self) -> RingHash {
        self.remote
    }

    /// Address of the remote node.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.lock().expect("connector lock poisoned").state
    }

    /// Requests queued but not yet written to the session.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("connector lock poisoned").pending.len()
    }

    /// Callers currently waiting on a response.
    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    fn next_sn(&self) -> u64 {
        self.next_sn.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a discovery request describing the local node.
    ///
    /// Returns whether the request was accepted for delivery, not whether
    /// the remote accepted it. The response goes to the observer.
    pub fn discover(&self, identity: &str, local_addr: NodeAddr, local_hash: RingHash) -> bool {
        let sn = self.next_sn();
        self.submit(Protocol::Discover(Discover::request(
            sn, identity, local_addr, local_hash,
        )))
    }

    /// Store `chunk` on the remote node and wait up to `timeout` for the
    /// answer. `false` on rejection, failure or timeout.
    pub async fn blocking_push(&self, chunk: &Chunk, timeout: Duration) -> bool {
        let sn = self.next_sn();
        let wait = self.monitors.register(sn);
        if !self.submit(Protocol::Push(Push::request(sn, self.remote, chunk))) {
            return false;
        }
        let accepted = matches!(wait.wait(timeout).await, Some(reply) if reply.is_success());
        debug!(remote = %self.remote, sn, label = chunk.label(), accepted, "push finished");
        accepted
    }

    /// Fetch `label` from the remote node, waiting up to `timeout`.
    /// `None` on a miss, rejection, failure or timeout.
    pub async fn blocking_pull(&self, label: &str, timeout: Duration) -> Option<Chunk> {
        let sn = self.next_sn();
        let wait = self.monitors.register(sn);
        if !self.submit(Protocol::Pull(Pull::request(sn, self.remote, label))) {
            return None;
        }
        let chunk = match wait.wait(timeout).await {
            Some(reply) if reply.is_success() => reply.chunk,
            _ => None,
        };
        debug!(remote = %self.remote, sn, label, found = chunk.is_some(), "pull finished");
        chunk
    }

    /// Queue `protocol` for delivery, connecting first if needed.
    fn submit(&self, protocol: Protocol) -> bool {
        let mut inner = self.inner.lock().expect("connector lock poisoned");
        match inner.state {
            ConnectorState::Closed => {
                debug!(remote = %self.remote, kind = protocol.kind(), "connector closed, request refused");
                return false;
            }
            ConnectorState::Disconnected => {
                inner.state = ConnectorState::Connecting;
                inner.pending.push_back(protocol);
                drop(inner);
                self.spawn_connect();
            }
            ConnectorState::Connecting => inner.pending.push_back(protocol),
            ConnectorState::Connected => {
                inner.pending.push_back(protocol);
                drop(inner);
                self.spawn_drain();
            }
        }
        true
    }

    fn spawn_connect(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let link: Arc<dyn ProtocolHandler> = Arc::new(SessionLink {
                connector: Arc::downgrade(&this),
            });
            match Session::connect(&this.addr, link, CONNECT_TIMEOUT).await {
                Ok(session) => {
                    {
                        let mut inner = this.inner.lock().expect("connector lock poisoned");
                        if inner.state == ConnectorState::Closed {
                            drop(inner);
                            session.close();
                            return;
                        }
                        inner.state = ConnectorState::Connected;
                        inner.session = Some(session);
                    }
                    info!(remote = %this.remote, addr = %this.addr, "connected to sibling");
                    this.spawn_drain();
                }
                Err(e) => {
                    warn!(remote = %this.remote, addr = %this.addr, %e, "connection failed");
                    this.fail(&e.to_string()).await;
                }
            }
        });
    }

    fn spawn_drain(&self) {
        // A running drain re-checks the queue before exiting.
        let Ok(permit) = self.drain_permits.clone().try_acquire_owned() else {
            return;
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move { this.drain(permit).await });
    }

    async fn drain(self: Arc<Self>, permit: OwnedSemaphorePermit) {
        let mut permit = Some(permit);
        loop {
            loop {
                let (session, protocol) = {
                    let mut inner = self.inner.lock().expect("connector lock poisoned");
                    let Some(session) = inner.session.clone() else {
                        return;
                    };
                    if inner.state != ConnectorState::Connected {
                        return;
                    }
                    match inner.pending.pop_front() {
                        Some(protocol) => (session, protocol),
                        None => break,
                    }
                };

                trace!(remote = %self.remote, kind = protocol.kind(), sn = protocol.sn(), "sending");
                match session.send(&protocol) {
                    Ok(()) => {}
                    // Unencodable requests fail alone.
                    Err(e @ NetError::Encode { .. }) => {
                        warn!(remote = %self.remote, kind = protocol.kind(), sn = protocol.sn(), %e, "request dropped");
                        self.monitors.fail(protocol.sn());
                    }
                    Err(e) => {
                        self.requeue_front(protocol);
                        self.fail(&e.to_string()).await;
                        return;
                    }
                }
            }

            drop(permit.take());

            let more = {
                let inner = self.inner.lock().expect("connector lock poisoned");
                inner.state == ConnectorState::Connected && !inner.pending.is_empty()
            };
            if !more {
                return;
            }
            match self.drain_permits.clone().try_acquire_owned() {
                Ok(p) => permit = Some(p),
                Err(_) => return,
            }
        }
    }

    fn requeue_front(&self, protocol: Protocol) {
        let mut inner = self.inner.lock().expect("connector lock poisoned");
        if inner.state != ConnectorState::Closed {
            inner.pending.push_front(protocol);
        }
    }

    /// Close the connection without notifying the observer. Outstanding
    /// requests fail immediately.
    pub fn disconnect(&self) {
        if let Some(pending) = self.close() {
            debug!(remote = %self.remote, dropped = pending.len(), "connector disconnected");
        }
    }

    /// Kill the connector and report every unsent request to the observer.
    pub async fn fail(&self, reason: &str) {
        let Some(pending) = self.close() else {
            return;
        };
        warn!(remote = %self.remote, addr = %self.addr, reason, unsent = pending.len(), "connector failed");

        let (Some(observer), Some(this)) = (self.observer.upgrade(), self.this.upgrade()) else {
            return;
        };
        let failure = |original| Failure {
            remote: self.remote,
            addr: self.addr.clone(),
            original,
            reason: reason.to_string(),
        };
        if pending.is_empty() {
            observer.connector_failed(&this, failure(None)).await;
        } else {
            for protocol in pending {
                observer.connector_failed(&this, failure(Some(protocol))).await;
            }
        }
    }

    /// Mark closed, drop the session and fail all waiters. Returns the
    /// unsent requests, or `None` if already closed.
    fn close(&self) -> Option<Vec<Protocol>> {
        let (pending, session) = {
            let mut inner = self.inner.lock().expect("connector lock poisoned");
            if inner.state == ConnectorState::Closed {
                return None;
            }
            inner.state = ConnectorState::Closed;
            (
                inner.pending.drain(..).collect::<Vec<_>>(),
                inner.session.take(),
            )
        };
        if let Some(session) = session {
            session.close();
        }
        for protocol in &pending {
            self.monitors.fail(protocol.sn());
        }
        self.monitors.fail_all();
        Some(pending)
    }

    async fn on_message(self: Arc<Self>, protocol: Protocol) {
        let Some(status) = protocol.status() else {
            debug!(remote = %self.remote, kind = protocol.kind(), "ignoring request on outbound connection");
            return;
        };
        match protocol {
            Protocol::Push(m) => self.resolve(m.sn, Reply { status, chunk: None }),
            Protocol::Pull(m) => {
                let chunk = m.chunk();
                self.resolve(m.sn, Reply { status, chunk })
            }
            Protocol::Discover(m) => match self.observer.upgrade() {
                Some(observer) => observer.discover_response(&self, m).await,
                None => debug!(remote = %self.remote, "discover response with no observer"),
            },
        }
    }

    fn resolve(&self, sn: u64, reply: Reply) {
        if !self.monitors.resolve(sn, reply) {
            debug!(remote = %self.remote, sn, "response with no waiter");
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("remote", &self.remote)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Routes events from the outbound session back to its connector.
struct SessionLink {
    connector: Weak<Connector>,
}

#[async_trait]
impl ProtocolHandler for SessionLink {
    async fn handle(&self, _session: &Session, protocol: Protocol) {
        if let Some(connector) = self.connector.upgrade() {
            connector.on_message(protocol).await;
        }
    }

    async fn session_closed(&self, _session: &Session, reason: Option<&NetError>) {
        let Some(connector) = self.connector.upgrade() else {
            return;
        };
        if let Some(e) = reason {
            debug!(remote = %connector.remote, %e, "outbound session error");
        }
        connector.fail(PEER_DISAPPEARED).await;
    }
}
