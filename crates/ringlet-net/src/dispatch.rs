//! Turns raw session deliveries into typed messages for a single handler.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{trace, warn};

use crate::error::NetError;
use crate::frame::FrameAssembler;
use crate::message::Protocol;
use crate::transport::Session;

/// Receiver of every message arriving on a set of sessions.
///
/// Exactly one handler is registered per listener or outbound session.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Handle a decoded message that arrived on `session`.
    async fn handle(&self, session: &Session, protocol: Protocol);

    /// Called once when `session` closes. `reason` is `None` on a clean EOF
    /// or a local close.
    async fn session_closed(&self, _session: &Session, _reason: Option<&NetError>) {}
}

/// Reassembles frames per session and forwards decoded messages.
///
/// Malformed frames and unknown message kinds are logged and dropped; the
/// session stays open.
pub struct Dispatcher {
    handler: Arc<dyn ProtocolHandler>,
    assembler: Mutex<FrameAssembler>,
}

impl Dispatcher {
    /// Create a dispatcher forwarding to `handler`.
    pub fn new(handler: Arc<dyn ProtocolHandler>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            assembler: Mutex::new(FrameAssembler::new()),
        })
    }

    /// Feed bytes read from `session`.
    pub async fn deliver(&self, session: &Session, data: Bytes) {
        let frames = self
            .assembler
            .lock()
            .expect("assembler lock poisoned")
            .push(session.id(), &data);

        for frame in frames {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(session = session.id(), peer = %session.peer(), %e, "dropping malformed frame");
                    continue;
                }
            };

            match Protocol::from_frame(&frame) {
                Ok(Some(protocol)) => {
                    trace!(
                        session = session.id(),
                        kind = protocol.kind(),
                        sn = protocol.sn(),
                        "dispatching message"
                    );
                    self.handler.handle(session, protocol).await;
                }
                Ok(None) => {
                    warn!(
                        session = session.id(),
                        kind = frame.get(crate::message::PROTOCOL_KEY).unwrap_or_default(),
                        "dropping frame of unknown protocol"
                    );
                }
                Err(e) => {
                    warn!(session = session.id(), %e, "dropping undecodable frame");
                }
            }
        }
    }

    /// Release the session's buffer and notify the handler.
    pub async fn closed(&self, session: &Session, reason: Option<&NetError>) {
        self.assembler
            .lock()
            .expect("assembler lock poisoned")
            .release(session.id());
        self.handler.session_closed(session, reason).await;
    }
}
