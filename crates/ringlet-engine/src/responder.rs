//! Answers requests arriving on the inbound listener.

use std::sync::Weak;

use async_trait::async_trait;
use ringlet_net::{Protocol, ProtocolHandler, Session};
use ringlet_placement::{NodeInfo, PhysicalNode};
use ringlet_types::Status;
use tracing::{debug, info, warn};

use crate::controller::Controller;

/// Listener-side handler of a controller.
pub(crate) struct Responder {
    controller: Weak<Controller>,
}

impl Responder {
    pub(crate) fn new(controller: Weak<Controller>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl ProtocolHandler for Responder {
    async fn handle(&self, session: &Session, protocol: Protocol) {
        if protocol.is_response() {
            debug!(peer = %session.peer(), kind = protocol.kind(), "ignoring response on listener");
            return;
        }
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let Some(root) = controller.root() else {
            debug!(peer = %session.peer(), kind = protocol.kind(), "controller not running, request dropped");
            return;
        };

        let response = respond(&root, controller.identity(), protocol);
        if let Err(e) = session.send(&response) {
            warn!(peer = %session.peer(), sn = response.sn(), %e, "failed to send response");
        }
    }
}

/// Build the answer to an inbound request.
///
/// Push and Pull are served only when addressed to our own ring position;
/// anything else is rejected and never forwarded.
pub(crate) fn respond(root: &PhysicalNode, identity: &str, protocol: Protocol) -> Protocol {
    match protocol {
        Protocol::Discover(m) => {
            if m.identity == identity {
                debug!(addr = %m.addr, "rejecting discovery from ourselves");
                return Protocol::Discover(m.respond(
                    Status::Reject,
                    identity,
                    root.addr().clone(),
                    root.hash(),
                ));
            }
            let sibling = NodeInfo {
                hash: m.hash,
                addr: m.addr.clone(),
            };
            if root.add_sibling(sibling) {
                info!(hash = %m.hash, addr = %m.addr, identity = %m.identity, "sibling announced itself");
            }
            Protocol::Discover(m.respond(
                Status::Success,
                identity,
                root.addr().clone(),
                root.hash(),
            ))
        }
        Protocol::Push(m) => {
            if m.target != root.hash() {
                debug!(label = %m.label, target = %m.target, "rejecting push for another node");
                return Protocol::Push(m.respond(Status::Reject));
            }
            let chunk = m.chunk();
            root.select_shard(chunk.hash()).put(chunk);
            Protocol::Push(m.respond(Status::Success))
        }
        Protocol::Pull(m) => {
            if m.target != root.hash() {
                debug!(label = %m.label, target = %m.target, "rejecting pull for another node");
                return Protocol::Pull(m.respond(Status::Reject, None));
            }
            let found = root
                .select_shard(ringlet_types::hash_chunk(&m.label))
                .get(&m.label);
            match found {
                Some(chunk) => Protocol::Pull(m.respond(Status::Success, Some(&chunk))),
                None => Protocol::Pull(m.respond(Status::Failure, None)),
            }
        }
    }
}
