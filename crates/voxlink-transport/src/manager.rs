use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use voxlink_runtime::lock;
use voxlink_types::{ConnectionState, Credential};

use crate::config::ConnectionSettings;
use crate::error::{ConnectionError, TransportError};
use crate::transport::{Transport, TransportEvent};

/// Capacity of the state and raw-payload broadcast channels.
const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Where and with what token to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub server_url: String,
    pub room_name: String,
    pub token: String,
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("server_url", &self.server_url)
            .field("room_name", &self.room_name)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl From<&Credential> for ConnectTarget {
    fn from(credential: &Credential) -> Self {
        Self {
            server_url: credential.server_url.clone(),
            room_name: credential.room_name.clone(),
            token: credential.value.clone(),
        }
    }
}

type SharedConnect = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

/// Owns the transport session and its state machine.
///
/// State changes are published synchronously on a broadcast channel while
/// the state lock is held, so subscribers observe transitions in the order
/// they were applied. Publishing never waits on subscribers.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    state: Mutex<ManagerState>,
    state_tx: broadcast::Sender<ConnectionState>,
    raw_tx: broadcast::Sender<Vec<u8>>,
}

struct ManagerState {
    current: ConnectionState,
    target: Option<ConnectTarget>,
    in_flight: Option<SharedConnect>,
    /// Bumped on every explicit disconnect or terminal close. Background
    /// work started under an older epoch must not touch the state.
    epoch: u64,
    reconnect: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if let Some(pump) = state.pump.as_ref() {
            pump.abort();
        }
        if let Some(reconnect) = state.reconnect.as_ref() {
            reconnect.abort();
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (raw_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                settings,
                state: Mutex::new(ManagerState {
                    current: ConnectionState::Disconnected,
                    target: None,
                    in_flight: None,
                    epoch: 0,
                    reconnect: None,
                    pump: None,
                }),
                state_tx,
                raw_tx,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.state).current
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribes to raw payloads received on the data channel.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.raw_tx.subscribe()
    }

    /// Opens the transport session.
    ///
    /// While `connecting`, concurrent callers share the in-flight attempt and
    /// its result. While `connected` or `reconnecting` this is a no-op.
    /// A failed attempt leaves the manager in `failed`; bad credentials are
    /// reported as [`ConnectionError::Auth`].
    pub async fn connect(&self, target: ConnectTarget) -> Result<(), ConnectionError> {
        let attempt = {
            let mut state = lock(&self.inner.state);
            match state.current {
                ConnectionState::Connected | ConnectionState::Reconnecting => return Ok(()),
                ConnectionState::Connecting => match state.in_flight.clone() {
                    Some(attempt) => attempt,
                    None => return Ok(()),
                },
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    self.inner.ensure_pump(&mut state);
                    self.inner
                        .transition(&mut state, ConnectionState::Connecting);
                    state.target = Some(target.clone());

                    let task = tokio::spawn(ManagerInner::run_connect(
                        self.inner.clone(),
                        target,
                        state.epoch,
                    ));
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(ConnectionError::Network(format!("connect task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Closes the session from any state. Never fails.
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = lock(&self.inner.state);
            state.epoch += 1;
            state.in_flight = None;
            if let Some(reconnect) = state.reconnect.take() {
                reconnect.abort();
            }
            let previous = state.current;
            if previous != ConnectionState::Disconnected {
                self.inner
                    .transition(&mut state, ConnectionState::Disconnected);
            }
            previous
        };

        if previous != ConnectionState::Disconnected {
            tracing::info!(from = %previous, "disconnecting transport");
            self.inner.transport.disconnect().await;
        }
    }

    /// Disconnects and stops listening to the transport.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Some(pump) = lock(&self.inner.state).pump.take() {
            pump.abort();
        }
    }

    /// Publishes one payload. Fails immediately, without retrying, unless
    /// the manager is `connected`.
    pub async fn send_raw(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        let current = self.state();
        if current != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(current));
        }
        self.inner
            .transport
            .publish_data(payload)
            .await
            .map_err(|e| match e {
                TransportError::NotConnected => ConnectionError::NotConnected(self.state()),
                other => other.into(),
            })
    }
}

impl ManagerInner {
    /// Applies a transition if the state machine allows it and publishes it.
    fn transition(&self, state: &mut ManagerState, next: ConnectionState) -> bool {
        let from = state.current;
        if !from.can_transition_to(next) {
            tracing::warn!(%from, to = %next, "ignoring illegal connection state transition");
            return false;
        }
        state.current = next;
        tracing::info!(%from, to = %next, "connection state changed");
        let _ = self.state_tx.send(next);
        true
    }

    fn ensure_pump(self: &Arc<Self>, state: &mut ManagerState) {
        if state.pump.as_ref().is_some_and(|pump| !pump.is_finished()) {
            return;
        }
        let events = self.transport.subscribe();
        state.pump = Some(tokio::spawn(pump_transport_events(
            Arc::downgrade(self),
            events,
        )));
    }

    async fn run_connect(
        self: Arc<Self>,
        target: ConnectTarget,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        tracing::info!(
            server_url = %target.server_url,
            room = %target.room_name,
            token_len = target.token.len(),
            "connecting transport"
        );

        let timeout = self.settings.connect_timeout();
        let outcome = match tokio::time::timeout(
            timeout,
            self.transport.connect(&target.server_url, &target.token),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::from(e)),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        };

        let superseded = {
            let mut state = lock(&self.state);
            if state.epoch != epoch {
                true
            } else {
                state.in_flight = None;
                match &outcome {
                    Ok(()) => {
                        self.transition(&mut state, ConnectionState::Connected);
                    }
                    Err(e) => {
                        tracing::warn!(fatal = e.is_fatal(), "transport connect failed: {}", e);
                        self.transition(&mut state, ConnectionState::Failed);
                    }
                }
                false
            }
        };

        if superseded {
            if outcome.is_ok() {
                self.transport.disconnect().await;
            }
            return Err(ConnectionError::Cancelled);
        }
        outcome
    }

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let mut state = lock(&self.state);
        match event {
            TransportEvent::Data(payload) => match state.current {
                ConnectionState::Connected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting => {
                    let _ = self.raw_tx.send(payload);
                }
                other => {
                    tracing::debug!(state = %other, bytes = payload.len(), "dropping payload received while offline");
                }
            },
            TransportEvent::ConnectionLost { reason } => {
                if state.current != ConnectionState::Connected {
                    return;
                }
                tracing::warn!(reason = %reason, "transport reported network loss");
                if self.transition(&mut state, ConnectionState::Reconnecting) {
                    let epoch = state.epoch;
                    state.reconnect = Some(tokio::spawn(reconnect_loop(
                        Arc::downgrade(self),
                        epoch,
                    )));
                }
            }
            TransportEvent::Resumed => {
                if state.current != ConnectionState::Reconnecting {
                    return;
                }
                if let Some(reconnect) = state.reconnect.take() {
                    reconnect.abort();
                }
                tracing::info!("transport resumed");
                self.transition(&mut state, ConnectionState::Connected);
            }
            TransportEvent::Closed { reason } => {
                tracing::warn!(reason = %reason, "transport closed by remote");
                state.epoch += 1;
                state.in_flight = None;
                if let Some(reconnect) = state.reconnect.take() {
                    reconnect.abort();
                }
                if state.current != ConnectionState::Disconnected {
                    self.transition(&mut state, ConnectionState::Disconnected);
                }
            }
        }
    }
}

async fn pump_transport_events(
    manager: Weak<ManagerInner>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                inner.on_transport_event(event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "transport event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Re-establishes a lost session. Gives up, moving to `disconnected`, once
/// the next backoff delay would push the summed delays past the budget or
/// the transport rejects the token.
async fn reconnect_loop(manager: Weak<ManagerInner>, epoch: u64) {
    let (policy, budget, timeout) = match manager.upgrade() {
        Some(inner) => (
            inner.settings.reconnect_policy(),
            inner.settings.reconnect_budget(),
            inner.settings.connect_timeout(),
        ),
        None => return,
    };

    let mut spent = Duration::ZERO;
    let mut attempt = 0;
    loop {
        let delay = policy.next_delay(attempt);
        if spent + delay > budget {
            tracing::warn!(
                attempts = attempt,
                spent_ms = spent.as_millis() as u64,
                "reconnection budget exhausted"
            );
            break;
        }
        tokio::time::sleep(delay).await;
        spent += delay;

        let Some(inner) = manager.upgrade() else {
            return;
        };
        let target = {
            let state = lock(&inner.state);
            if state.epoch != epoch || state.current != ConnectionState::Reconnecting {
                return;
            }
            state.target.clone()
        };
        let Some(target) = target else {
            break;
        };

        attempt += 1;
        match tokio::time::timeout(
            timeout,
            inner.transport.connect(&target.server_url, &target.token),
        )
        .await
        {
            Ok(Ok(())) => {
                let mut state = lock(&inner.state);
                if state.epoch == epoch && state.current == ConnectionState::Reconnecting {
                    state.reconnect = None;
                    tracing::info!(attempt, "transport reconnected");
                    inner.transition(&mut state, ConnectionState::Connected);
                }
                return;
            }
            Ok(Err(e)) if e.is_fatal() => {
                tracing::warn!(attempt, "reconnect rejected: {}", e);
                break;
            }
            Ok(Err(e)) => tracing::debug!(attempt, "reconnect attempt failed: {}", e),
            Err(_) => tracing::debug!(attempt, "reconnect attempt timed out"),
        }
    }

    let Some(inner) = manager.upgrade() else {
        return;
    };
    let gave_up = {
        let mut state = lock(&inner.state);
        if state.epoch == epoch && state.current == ConnectionState::Reconnecting {
            state.epoch += 1;
            state.reconnect = None;
            inner.transition(&mut state, ConnectionState::Disconnected)
        } else {
            false
        }
    };
    if gave_up {
        inner.transport.disconnect().await;
    }
}
