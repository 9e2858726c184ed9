use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Something the transport reports without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The network path was lost; the session may still resume.
    ConnectionLost { reason: String },
    /// The transport recovered on its own after a loss.
    Resumed,
    /// The remote end closed the session for good.
    Closed { reason: String },
    /// A data-channel payload from the remote peer.
    Data(Vec<u8>),
}

/// The external real-time transport, used as a black box.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Joins the session at `server_url` with `token`.
    async fn connect(&self, server_url: &str, token: &str) -> Result<(), TransportError>;

    /// Leaves the session. Best-effort; never fails.
    async fn disconnect(&self);

    /// Publishes one payload on the data channel. No delivery guarantee.
    async fn publish_data(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Subscribes to unsolicited transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Creates a fresh transport for each session.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Transport> {
        self()
    }
}
