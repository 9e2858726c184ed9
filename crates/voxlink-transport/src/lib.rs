//! Connection lifecycle for the real-time transport.
//!
//! The transport itself (media negotiation, SFU, congestion control) is an
//! opaque collaborator behind the [`Transport`] trait. [`ConnectionManager`]
//! owns one transport for a session, drives it through the
//! [`ConnectionState`](voxlink_types::ConnectionState) machine, reconnects
//! with capped backoff after network loss, and exposes the raw
//! send/receive primitive the message layer builds on.

pub mod config;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod transport;

pub use config::ConnectionSettings;
pub use error::{ConnectionError, TransportError};
pub use loopback::LoopbackTransport;
pub use manager::{ConnectTarget, ConnectionManager};
pub use transport::{Transport, TransportEvent, TransportFactory};
