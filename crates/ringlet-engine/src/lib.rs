//! Node controller tying all ringlet components together.
//!
//! The [`Controller`] owns the local [`PhysicalNode`](ringlet_placement::PhysicalNode),
//! the inbound listener and the outbound connectors, and exposes the
//! chunk read/write API. Ownership is resolved on the consistent-hashing
//! ring; requests for chunks owned by a sibling block on a remote call
//! bounded by the caller's timeout.

pub mod config;
pub mod controller;
mod discovery;
pub mod error;
mod responder;

pub use config::{ControllerConfig, DEFAULT_PORT};
pub use controller::{Controller, ControllerStats};
pub use error::EngineError;

#[cfg(test)]
mod tests;
