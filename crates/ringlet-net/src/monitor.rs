//! Waiters for responses to outstanding requests, keyed by serial number.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ringlet_types::{Chunk, Status};
use tokio::sync::oneshot;
use tracing::trace;

/// What a waiter receives when its request is answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status from the response.
    pub status: Status,
    /// Chunk carried by a pull response.
    pub chunk: Option<Chunk>,
}

impl Reply {
    /// A failed reply with no chunk.
    pub fn failure() -> Self {
        Self {
            status: Status::Failure,
            chunk: None,
        }
    }

    /// Whether the remote reported success.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

struct Monitor {
    created_at: Instant,
    tx: oneshot::Sender<Reply>,
}

/// Outstanding requests awaiting a response.
///
/// Each entry is registered before its request is queued and removed when
/// the caller stops waiting, whether it was answered, failed or timed out.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Mutex<HashMap<u64, Monitor>>,
}

impl MonitorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a waiter for `sn`. Dropping the returned handle unregisters it.
    pub fn register(self: &Arc<Self>, sn: u64) -> MonitorWait {
        let (tx, rx) = oneshot::channel();
        self.monitors.lock().expect("monitor lock poisoned").insert(
            sn,
            Monitor {
                created_at: Instant::now(),
                tx,
            },
        );
        MonitorWait {
            sn,
            rx: Some(rx),
            registry: self.clone(),
        }
    }

    /// Deliver `reply` to the waiter for `sn`. Returns false when nobody is
    /// waiting (late or unsolicited response).
    pub fn resolve(&self, sn: u64, reply: Reply) -> bool {
        let monitor = self.monitors.lock().expect("monitor lock poisoned").remove(&sn);
        match monitor {
            Some(m) => {
                trace!(sn, elapsed = ?m.created_at.elapsed(), status = %reply.status, "resolved monitor");
                m.tx.send(reply).is_ok()
            }
            None => false,
        }
    }

    /// Fail the waiter for `sn`, if any.
    pub fn fail(&self, sn: u64) -> bool {
        self.resolve(sn, Reply::failure())
    }

    /// Fail every waiter.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Monitor> = self
            .monitors
            .lock()
            .expect("monitor lock poisoned")
            .drain()
            .map(|(_, m)| m)
            .collect();
        let count = drained.len();
        for monitor in drained {
            let _ = monitor.tx.send(Reply::failure());
        }
        count
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.monitors.lock().expect("monitor lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, sn: u64) {
        self.monitors.lock().expect("monitor lock poisoned").remove(&sn);
    }
}

/// Handle held by a blocked caller.
pub struct MonitorWait {
    sn: u64,
    rx: Option<oneshot::Receiver<Reply>>,
    registry: Arc<MonitorRegistry>,
}

impl MonitorWait {
    /// Serial number being waited on.
    pub fn sn(&self) -> u64 {
        self.sn
    }

    /// Wait up to `timeout` for the reply. `None` on timeout.
    pub async fn wait(mut self, timeout: Duration) -> Option<Reply> {
        let rx = self.rx.take()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => Some(Reply::failure()),
            Err(_) => {
                trace!(sn = self.sn, ?timeout, "monitor timed out");
                None
            }
        }
    }
}

impl Drop for MonitorWait {
    fn drop(&mut self) {
        self.registry.remove(self.sn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let registry = MonitorRegistry::new();
        let wait = registry.register(7);
        assert_eq!(registry.len(), 1);

        let chunk = Chunk::new("k", b"v");
        assert!(registry.resolve(
            7,
            Reply {
                status: Status::Success,
                chunk: Some(chunk.clone()),
            }
        ));

        let reply = wait.wait(Duration::from_secs(1)).await.unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.chunk, Some(chunk));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let registry = MonitorRegistry::new();
        let wait = registry.register(1);
        assert!(wait.wait(Duration::from_millis(20)).await.is_none());
        assert!(registry.is_empty());
        assert!(!registry.resolve(1, Reply::failure()));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_every_waiter() {
        let registry = MonitorRegistry::new();
        let a = registry.register(1);
        let b = registry.register(2);
        assert_eq!(registry.fail_all(), 2);

        assert_eq!(a.wait(Duration::from_secs(1)).await, Some(Reply::failure()));
        assert_eq!(b.wait(Duration::from_secs(1)).await, Some(Reply::failure()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sn_is_ignored() {
        let registry = MonitorRegistry::new();
        let _wait = registry.register(1);
        assert!(!registry.resolve(99, Reply::failure()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_drop_without_waiting_unregisters() {
        let registry = MonitorRegistry::new();
        let wait = registry.register(3);
        drop(wait);
        assert!(registry.is_empty());
    }
}
