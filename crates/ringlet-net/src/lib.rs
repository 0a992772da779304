//! Wire protocol and peer connections over TCP.
//!
//! This crate implements ringlet's network layer:
//!
//! - [`Frame`] and [`FrameAssembler`]: the `Key: Value` header framing with
//!   an optional binary payload, reassembled per session.
//! - [`Protocol`]: the typed Discover/Push/Pull messages.
//! - [`Session`] and [`Listener`]: TCP connections whose inbound messages
//!   are handed to a single [`ProtocolHandler`].
//! - [`Connector`]: one outbound connection per sibling, giving callers a
//!   blocking request/response contract with timeouts.

mod connector;
mod dispatch;
mod error;
mod frame;
mod message;
mod monitor;
#[cfg(test)]
mod tests;
mod transport;

pub use connector::{
    CONNECT_TIMEOUT, Connector, ConnectorObserver, ConnectorState, MAX_DRAIN_TASKS,
    PEER_DISAPPEARED,
};
pub use dispatch::{Dispatcher, ProtocolHandler};
pub use error::NetError;
pub use frame::{
    Frame, FrameAssembler, MAX_FRAME_SIZE, PAYLOAD_KEY, PAYLOAD_SEPARATOR, TERMINATOR, parse_frame,
};
pub use message::{Discover, Failure, PROTOCOL_KEY, Protocol, Pull, Push, SN_KEY, STATUS_KEY};
pub use monitor::{MonitorRegistry, MonitorWait, Reply};
pub use transport::{Listener, Session, SessionId};
