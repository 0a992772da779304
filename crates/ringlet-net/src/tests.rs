//! Integration tests for sessions and connectors over loopback TCP.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use ringlet_types::{Chunk, NodeAddr, RingHash, Status};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::{
        Connector, ConnectorObserver, ConnectorState, Discover, Failure, Listener,
        PEER_DISAPPEARED, Protocol, ProtocolHandler, Session,
    };

    const REMOTE: RingHash = RingHash::new(50);

    /// Stores pushed chunks and answers pulls, like a real owner would.
    #[derive(Default)]
    struct StorePeer {
        chunks: Mutex<HashMap<String, Chunk>>,
        order: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProtocolHandler for StorePeer {
        async fn handle(&self, session: &Session, protocol: Protocol) {
            let response = match protocol {
                Protocol::Push(m) => {
                    self.order.lock().unwrap().push(m.label.clone());
                    self.chunks.lock().unwrap().insert(m.label.clone(), m.chunk());
                    Protocol::Push(m.respond(Status::Success))
                }
                Protocol::Pull(m) => {
                    let found = self.chunks.lock().unwrap().get(&m.label).cloned();
                    match found {
                        Some(chunk) => Protocol::Pull(m.respond(Status::Success, Some(&chunk))),
                        None => Protocol::Pull(m.respond(Status::Failure, None)),
                    }
                }
                Protocol::Discover(m) => Protocol::Discover(m.respond(
                    Status::Success,
                    "peer-identity",
                    NodeAddr::new("127.0.0.1", 1),
                    REMOTE,
                )),
            };
            session.send(&response).unwrap();
        }
    }

    /// Never answers anything.
    struct SilentPeer;

    #[async_trait]
    impl ProtocolHandler for SilentPeer {
        async fn handle(&self, _session: &Session, _protocol: Protocol) {}
    }

    /// Holds pull requests until `batch` have arrived, then answers them
    /// in reverse order with the label as the data.
    struct ReversingPeer {
        batch: usize,
        held: Mutex<Vec<crate::Pull>>,
    }

    #[async_trait]
    impl ProtocolHandler for ReversingPeer {
        async fn handle(&self, session: &Session, protocol: Protocol) {
            let Protocol::Pull(m) = protocol else { return };
            let ready = {
                let mut held = self.held.lock().unwrap();
                held.push(m);
                if held.len() < self.batch {
                    return;
                }
                std::mem::take(&mut *held)
            };
            for m in ready.into_iter().rev() {
                let chunk = Chunk::new(m.label.clone(), m.label.as_bytes());
                session
                    .send(&Protocol::Pull(m.respond(Status::Success, Some(&chunk))))
                    .unwrap();
            }
        }
    }

    /// Closes the session as soon as any request arrives.
    struct VanishingPeer;

    #[async_trait]
    impl ProtocolHandler for VanishingPeer {
        async fn handle(&self, session: &Session, _protocol: Protocol) {
            session.close();
        }
    }

    #[derive(Debug)]
    enum Event {
        Discovered(Discover),
        Failed(Failure),
    }

    struct RecordingObserver {
        events: mpsc::UnboundedSender<Event>,
    }

    #[async_trait]
    impl ConnectorObserver for RecordingObserver {
        async fn discover_response(&self, _connector: &Arc<Connector>, response: Discover) {
            let _ = self.events.send(Event::Discovered(response));
        }

        async fn connector_failed(&self, _connector: &Arc<Connector>, failure: Failure) {
            let _ = self.events.send(Event::Failed(failure));
        }
    }

    async fn start_peer(handler: Arc<dyn ProtocolHandler>) -> (Listener, NodeAddr) {
        let listener = Listener::bind("127.0.0.1:0", handler).await.unwrap();
        let addr = NodeAddr::from(listener.local_addr());
        (listener, addr)
    }

    fn connector_to(
        addr: NodeAddr,
    ) -> (
        Arc<Connector>,
        Arc<RecordingObserver>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = Arc::new(RecordingObserver { events: tx });
        let weak = Arc::downgrade(&observer) as std::sync::Weak<dyn ConnectorObserver>;
        (Connector::new(REMOTE, addr, weak), observer, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no observer event")
            .expect("observer channel closed")
    }

    #[tokio::test]
    async fn test_push_then_pull_through_connector() {
        let (_listener, addr) = start_peer(Arc::new(StorePeer::default())).await;
        let (connector, _observer, _rx) = connector_to(addr);
        assert_eq!(connector.state(), ConnectorState::Disconnected);

        let chunk = Chunk::new("user:42", b"\x00binary\r\n\r\npayload");
        assert!(connector.blocking_push(&chunk, Duration::from_secs(5)).await);
        assert_eq!(connector.state(), ConnectorState::Connected);

        let got = connector
            .blocking_pull("user:42", Duration::from_secs(5))
            .await;
        assert_eq!(got, Some(chunk));

        let miss = connector.blocking_pull("absent", Duration::from_secs(5)).await;
        assert!(miss.is_none());
        assert_eq!(connector.monitor_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_without_leaking_monitor() {
        let (_listener, addr) = start_peer(Arc::new(SilentPeer)).await;
        let (connector, _observer, _rx) = connector_to(addr);

        let before = connector.monitor_count();
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        let got = connector.blocking_pull("user:42", timeout).await;
        let elapsed = start.elapsed();

        assert!(got.is_none());
        assert!(elapsed >= timeout, "returned after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(2), "returned after {elapsed:?}");
        assert_eq!(connector.monitor_count(), before);

        assert!(
            !connector
                .blocking_push(&Chunk::new("k", b"v"), Duration::from_millis(50))
                .await
        );
        assert_eq!(connector.monitor_count(), before);
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let peer = Arc::new(ReversingPeer {
            batch: 2,
            held: Mutex::new(Vec::new()),
        });
        let (_listener, addr) = start_peer(peer).await;
        let (connector, _observer, _rx) = connector_to(addr);

        let timeout = Duration::from_secs(5);
        let (first, second) = tokio::join!(
            connector.blocking_pull("first", timeout),
            connector.blocking_pull("second", timeout),
        );
        assert_eq!(first.unwrap().data().as_ref(), b"first");
        assert_eq!(second.unwrap().data().as_ref(), b"second");
        assert_eq!(connector.monitor_count(), 0);
    }

    #[tokio::test]
    async fn test_unencodable_label_fails_only_its_own_request() {
        let (_listener, addr) = start_peer(Arc::new(StorePeer::default())).await;
        let (connector, _observer, mut rx) = connector_to(addr);
        let timeout = Duration::from_secs(10);

        assert!(connector.blocking_push(&Chunk::new("good", b"1"), timeout).await);

        let start = Instant::now();
        assert!(!connector.blocking_push(&Chunk::new("bad ", b"2"), timeout).await);
        assert!(start.elapsed() < Duration::from_secs(2));

        assert_eq!(connector.state(), ConnectorState::Connected);
        assert!(connector.blocking_push(&Chunk::new("after", b"3"), timeout).await);
        assert_eq!(
            connector.blocking_pull("good", timeout).await,
            Some(Chunk::new("good", b"1"))
        );
        assert_eq!(connector.monitor_count(), 0);
        assert!(rx.try_recv().is_err(), "observer must not see a failure");
    }

    #[tokio::test]
    async fn test_unencodable_label_leaves_other_waiters_alone() {
        let (_listener, addr) = start_peer(Arc::new(SilentPeer)).await;
        let (connector, _observer, mut rx) = connector_to(addr);
        let patience = Duration::from_millis(500);

        let waiter = {
            let connector = connector.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let got = connector.blocking_pull("innocent", patience).await;
                (got, start.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let got = connector
            .blocking_pull("evil\nlabel", Duration::from_secs(10))
            .await;
        assert!(got.is_none());

        let (got, elapsed) = waiter.await.unwrap();
        assert!(got.is_none());
        assert!(elapsed >= patience, "woken early after {elapsed:?}");
        assert_eq!(connector.state(), ConnectorState::Connected);
        assert!(rx.try_recv().is_err(), "observer must not see a failure");
    }

    #[tokio::test]
    async fn test_requests_queued_while_connecting_drain_in_order() {
        let peer = Arc::new(StorePeer::default());
        let (_listener, addr) = start_peer(peer.clone()).await;
        let (connector, _observer, _rx) = connector_to(addr);

        let timeout = Duration::from_secs(5);
        let (ca, cb, cc) = (
            Chunk::new("a", b"1"),
            Chunk::new("b", b"2"),
            Chunk::new("c", b"3"),
        );
        let (a, b, c) = tokio::join!(
            connector.blocking_push(&ca, timeout),
            connector.blocking_push(&cb, timeout),
            connector.blocking_push(&cc, timeout),
        );
        assert!(a && b && c);
        assert_eq!(*peer.order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(connector.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queued_requests() {
        let addr = {
            let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            NodeAddr::from(reserved.local_addr().unwrap())
        };
        let (connector, _observer, mut rx) = connector_to(addr.clone());

        let start = Instant::now();
        let stored = connector
            .blocking_push(&Chunk::new("k", b"v"), Duration::from_secs(10))
            .await;
        assert!(!stored);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert_eq!(connector.monitor_count(), 0);

        let Event::Failed(failure) = next_event(&mut rx).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.remote, REMOTE);
        assert_eq!(failure.addr, addr);
        assert!(matches!(failure.original, Some(Protocol::Push(ref p)) if p.label == "k"));

        // A dead connector refuses further work.
        assert!(!connector.discover("me", NodeAddr::new("127.0.0.1", 1), RingHash::new(1)));
    }

    #[tokio::test]
    async fn test_peer_disappearing_wakes_waiter_and_reports_failure() {
        let (_listener, addr) = start_peer(Arc::new(VanishingPeer)).await;
        let (connector, _observer, mut rx) = connector_to(addr);

        let start = Instant::now();
        let got = connector.blocking_pull("k", Duration::from_secs(10)).await;
        assert!(got.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));

        let Event::Failed(failure) = next_event(&mut rx).await else {
            panic!("expected failure");
        };
        assert_eq!(failure.reason, PEER_DISAPPEARED);
        assert!(failure.original.is_none());
        assert_eq!(connector.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_discover_response_goes_to_observer() {
        let (_listener, addr) = start_peer(Arc::new(StorePeer::default())).await;
        let (connector, _observer, mut rx) = connector_to(addr);

        assert!(connector.discover("local-identity", NodeAddr::new("127.0.0.1", 9), RingHash::new(10)));

        let Event::Discovered(response) = next_event(&mut rx).await else {
            panic!("expected discover response");
        };
        assert_eq!(response.status, Some(Status::Success));
        assert_eq!(response.identity, "peer-identity");
        assert_eq!(response.hash, REMOTE);
    }

    #[tokio::test]
    async fn test_disconnect_fails_waiters_silently() {
        let (_listener, addr) = start_peer(Arc::new(SilentPeer)).await;
        let (connector, _observer, mut rx) = connector_to(addr);

        let waiter = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.blocking_pull("k", Duration::from_secs(10)).await })
        };
        while connector.monitor_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        connector.disconnect();

        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert_eq!(connector.state(), ConnectorState::Closed);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_session_survives() {
        let peer = Arc::new(StorePeer::default());
        let (listener, _addr) = start_peer(peer.clone()).await;

        let mut stream = tokio::net::TcpStream::connect(listener.local_addr()).await.unwrap();
        stream.write_all(b"no colon here\r\n\r\n").await.unwrap();
        stream.write_all(b"Protocol: gossip\nSN: 1\r\n\r\n").await.unwrap();

        let push = Protocol::Push(crate::Push::request(2, REMOTE, &Chunk::new("ok", b"1")));
        let bytes = push.to_frame().encode().unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while peer.order.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "push never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*peer.order.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_listener_shutdown_closes_sessions() {
        let (listener, addr) = start_peer(Arc::new(SilentPeer)).await;
        let session = Session::connect(&addr, Arc::new(SilentPeer), Duration::from_secs(5))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while listener.session_count() == 0 {
            assert!(Instant::now() < deadline, "session never accepted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        listener.shutdown();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.is_closed() {
            assert!(Instant::now() < deadline, "client session still open");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.send(&Protocol::Pull(crate::Pull::request(1, REMOTE, "x"))).is_err());
    }
}
