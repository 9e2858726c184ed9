//! In-memory transport pair with fault injection.
//!
//! Two [`LoopbackTransport`] endpoints share one simulated link. A payload
//! published on one side is delivered to the other side as
//! [`TransportEvent::Data`] while both sides are connected and the link is
//! up. The control methods (`drop_link`, `resume_link`, `close`,
//! `set_reject_auth`, `fail_next_connects`, `fail_sends`, `inject`) let
//! tests and the smoke binary exercise every failure path of the
//! connection and delivery layers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use voxlink_runtime::lock;

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

const LOOPBACK_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Link {
    down: AtomicBool,
}

#[derive(Debug)]
struct Endpoint {
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    reject_auth: AtomicBool,
    fail_sends: AtomicBool,
    failing_connects: AtomicU32,
    connect_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    connect_delay: Mutex<Duration>,
    published: Mutex<Vec<Vec<u8>>>,
}

impl Endpoint {
    fn new() -> Self {
        let (events, _) = broadcast::channel(LOOPBACK_EVENT_CAPACITY);
        Self {
            events,
            connected: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            failing_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            published: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// One end of an in-memory link.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    link: Arc<Link>,
}

impl LoopbackTransport {
    /// Creates two endpoints joined by one link.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Endpoint::new());
        let b = Arc::new(Endpoint::new());
        let link = Arc::new(Link::default());
        (
            Self {
                local: a.clone(),
                remote: b.clone(),
                link: link.clone(),
            },
            Self {
                local: b,
                remote: a,
                link,
            },
        )
    }

    pub fn is_connected(&self) -> bool {
        self.local.connected.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u32 {
        self.local.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.local.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Every payload this endpoint successfully published, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        lock(&self.local.published).clone()
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.local.connect_delay) = delay;
    }

    /// Makes every subsequent `connect` fail with `Unauthorized`.
    pub fn set_reject_auth(&self, reject: bool) {
        self.local.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Makes the next `count` connects fail with a network error.
    pub fn fail_next_connects(&self, count: u32) {
        self.local.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Makes `publish_data` fail with a network error while set.
    pub fn fail_sends(&self, fail: bool) {
        self.local.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Takes the link down and reports the loss to both connected sides.
    pub fn drop_link(&self) {
        self.link.down.store(true, Ordering::SeqCst);
        for endpoint in [&self.local, &self.remote] {
            if endpoint.connected.load(Ordering::SeqCst) {
                endpoint.emit(TransportEvent::ConnectionLost {
                    reason: "link down".to_string(),
                });
            }
        }
    }

    /// Restores the link and reports the recovery to both connected sides.
    pub fn resume_link(&self) {
        self.link.down.store(false, Ordering::SeqCst);
        for endpoint in [&self.local, &self.remote] {
            if endpoint.connected.load(Ordering::SeqCst) {
                endpoint.emit(TransportEvent::Resumed);
            }
        }
    }

    /// Restores the link without emitting `Resumed`, so only an explicit
    /// reconnect brings a side back.
    pub fn heal_link_silently(&self) {
        self.link.down.store(false, Ordering::SeqCst);
    }

    /// Simulates the server closing this endpoint's session.
    pub fn close(&self, reason: &str) {
        self.local.connected.store(false, Ordering::SeqCst);
        self.local.emit(TransportEvent::Closed {
            reason: reason.to_string(),
        });
    }

    /// Delivers `payload` to this endpoint as if the peer had sent it.
    pub fn inject(&self, payload: &[u8]) {
        self.local.emit(TransportEvent::Data(payload.to_vec()));
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _server_url: &str, _token: &str) -> Result<(), TransportError> {
        self.local.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.local.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.local.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Unauthorized("token rejected".to_string()));
        }
        let failing = self.local.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.local
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::Network("connection refused".to_string()));
        }
        if self.link.down.load(Ordering::SeqCst) {
            return Err(TransportError::Network("link down".to_string()));
        }

        self.local.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.local.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.local.connected.store(false, Ordering::SeqCst);
    }

    async fn publish_data(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.local.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.local.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Network("publish failed".to_string()));
        }
        if self.link.down.load(Ordering::SeqCst) {
            return Err(TransportError::Network("link down".to_string()));
        }

        lock(&self.local.published).push(payload.to_vec());
        if self.remote.connected.load(Ordering::SeqCst) {
            self.remote.emit(TransportEvent::Data(payload.to_vec()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.local.events.subscribe()
    }
}
