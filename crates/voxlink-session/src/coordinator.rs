use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use voxlink_credentials::{CredentialProvider, CredentialSource};
use voxlink_delivery::{DeliveryEngine, DeliveryEvent, LocalIdentity, QueuedMessage};
use voxlink_runtime::{lock, CleanupError, CleanupReport, Clock, LifecycleRegistry};
use voxlink_transport::{ConnectTarget, ConnectionManager, TransportFactory};
use voxlink_types::{ChatMessage, ConnectionState, ErrorEvent, SessionError};

use crate::config::Config;
use crate::snapshot::{SessionPhase, SessionSnapshot};

const EVENT_BROADCAST_CAPACITY: usize = 256;

// Teardown order: stop delivery before the channel closes, then the
// transport, then the credential, and the event forwarders last so they
// observe everything the earlier steps emit.
const PRIORITY_DELIVERY: i32 = 10;
const PRIORITY_CONNECTION: i32 = 20;
const PRIORITY_CREDENTIALS: i32 = 30;
const PRIORITY_FORWARDERS: i32 = 40;

/// External collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub credentials: Arc<dyn CredentialSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Local participant id. A random `user-<uuid>` id is used when absent.
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

/// Composes credentials, connection and delivery into one session.
///
/// Every `start` builds fresh component instances; nothing is shared
/// between sessions. Teardown of a session, whether from `end` or from a
/// failed `start`, goes through that session's [`LifecycleRegistry`].
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    deps: SessionDeps,
    config: Config,
    state: Mutex<CoordinatorState>,
    snapshots: broadcast::Sender<SessionSnapshot>,
    messages: broadcast::Sender<DeliveryEvent>,
    errors: broadcast::Sender<ErrorEvent>,
}

#[derive(Default)]
struct CoordinatorState {
    snapshot: SessionSnapshot,
    /// Bumped by every `start`; events from older sessions are ignored.
    generation: u64,
    active: Option<ActiveSession>,
    /// Engine of the latest session, kept after `end` for status lookups.
    engine: Option<DeliveryEngine>,
    ending: Option<SharedEnd>,
}

struct ActiveSession {
    generation: u64,
    registry: LifecycleRegistry,
}

type SharedEnd = Shared<BoxFuture<'static, ()>>;

impl fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl SessionCoordinator {
    pub fn new(deps: SessionDeps, config: Config) -> Self {
        let (snapshots, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (messages, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let (errors, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(CoordinatorInner {
                deps,
                config,
                state: Mutex::new(CoordinatorState::default()),
                snapshots,
                messages,
                errors,
            }),
        }
    }

    /// Starts a session: resolves the local identity, obtains a credential,
    /// and connects.
    ///
    /// On failure every component built for this attempt is torn down, the
    /// error is published once on the error stream, and the same error is
    /// returned.
    pub async fn start(&self, options: StartOptions) -> Result<(), SessionError> {
        let inner = &self.inner;
        let identity = LocalIdentity {
            id: options
                .user_id
                .unwrap_or_else(|| format!("user-{}", Uuid::new_v4())),
            name: options.display_name,
        };

        let provider = CredentialProvider::new(
            inner.deps.credentials.clone(),
            &inner.config.credentials,
            inner.deps.clock.clone(),
        );
        let connection =
            ConnectionManager::new(inner.deps.transports.create(), inner.config.connection.clone());

        let generation = {
            let mut state = lock(&inner.state);
            if !state.snapshot.phase.can_start() || state.ending.is_some() {
                return Err(SessionError::InvalidState(format!(
                    "cannot start a session while {:?}",
                    state.snapshot.phase
                )));
            }
            state.generation += 1;
            let generation = state.generation;

            // The engine idles until the connection comes up.
            let engine = DeliveryEngine::attach(
                connection.clone(),
                identity.clone(),
                inner.config.delivery.clone(),
                inner.deps.clock.clone(),
            );
            let registry =
                inner.build_registry(generation, &provider, &connection, &engine);

            state.active = Some(ActiveSession {
                generation,
                registry,
            });
            state.engine = Some(engine);
            state.snapshot = SessionSnapshot {
                phase: SessionPhase::Starting,
                connection: connection.state(),
                local_id: Some(identity.id.clone()),
                display_name: identity.name.clone(),
                ..SessionSnapshot::default()
            };
            inner.publish(&mut state);
            generation
        };

        tracing::info!(user_id = %identity.id, generation, "starting session");
        match inner
            .establish(generation, &identity, &provider, &connection)
            .await
        {
            Ok(()) => {
                {
                    let mut state = lock(&inner.state);
                    if state.owns(generation) {
                        state.snapshot.phase = SessionPhase::Active;
                        state.snapshot.connection = connection.state();
                        inner.publish(&mut state);
                        tracing::info!(user_id = %identity.id, "session active");
                        return Ok(());
                    }
                }
                // The session was ended while connecting; its teardown may
                // have run before this connection opened.
                connection.shutdown().await;
                Err(superseded())
            }
            Err(error) => {
                let Some(active) = inner.take_active(generation) else {
                    connection.shutdown().await;
                    return Err(superseded());
                };
                tracing::warn!(category = error.category().code(), "session start failed: {}", error);
                let report = active.registry.run_all().await;
                log_report(&report);

                let event = ErrorEvent::new(&error, inner.deps.clock.now_ms());
                {
                    let mut state = lock(&inner.state);
                    if state.generation == generation {
                        state.snapshot.phase = SessionPhase::Failed;
                        state.snapshot.connection = ConnectionState::Disconnected;
                        state.snapshot.remote_typing = false;
                        state.snapshot.last_error = Some(event.clone());
                        inner.publish(&mut state);
                    }
                }
                let _ = inner.errors.send(event);
                Err(error)
            }
        }
    }

    /// Ends the current session. Safe to call any number of times.
    ///
    /// Concurrent calls share one teardown; calls after it finished are
    /// no-ops.
    pub async fn end(&self) {
        let ending = {
            let mut state = lock(&self.inner.state);
            if let Some(ending) = state.ending.clone() {
                ending
            } else {
                let Some(active) = state.active.take() else {
                    tracing::debug!("end called without an active session");
                    return;
                };
                state.snapshot.phase = SessionPhase::Ending;
                self.inner.publish(&mut state);
                self.inner
                    .begin_teardown(&mut state, active, SessionPhase::Ended)
            }
        };
        ending.await;
    }

    /// Queues a chat message and returns its id.
    pub fn send_message(&self, text: &str) -> Result<String, SessionError> {
        self.active_engine()?.send(text)
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.active_engine()?.set_typing(is_typing).await;
        Ok(())
    }

    /// Current view of an outbound message of the latest session.
    pub fn message_status(&self, message_id: &str) -> Option<QueuedMessage> {
        lock(&self.inner.state)
            .engine
            .as_ref()
            .and_then(|engine| engine.message_status(message_id))
    }

    /// Messages of the latest session, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.inner.state)
            .engine
            .as_ref()
            .map(DeliveryEngine::history)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        lock(&self.inner.state).snapshot.clone()
    }

    /// Every change of the merged session state.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Received messages and outbound status changes.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.messages.subscribe()
    }

    /// Surfaced errors, each published exactly once.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.inner.errors.subscribe()
    }

    fn active_engine(&self) -> Result<DeliveryEngine, SessionError> {
        let state = lock(&self.inner.state);
        match (&state.active, &state.engine) {
            (Some(_), Some(engine)) if state.snapshot.phase == SessionPhase::Active => {
                Ok(engine.clone())
            }
            _ => Err(SessionError::InvalidState(format!(
                "no active session ({:?})",
                state.snapshot.phase
            ))),
        }
    }
}

impl CoordinatorState {
    fn owns(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }
}

impl CoordinatorInner {
    fn publish(&self, state: &mut CoordinatorState) {
        state.snapshot.updated_at_ms = self.deps.clock.now_ms();
        let _ = self.snapshots.send(state.snapshot.clone());
    }

    /// Registers the teardown of every component of one session.
    fn build_registry(
        self: &Arc<Self>,
        generation: u64,
        provider: &CredentialProvider,
        connection: &ConnectionManager,
        engine: &DeliveryEngine,
    ) -> LifecycleRegistry {
        let registry = LifecycleRegistry::new();

        let delivery = engine.clone();
        registry.register("delivery", PRIORITY_DELIVERY, move || async move {
            delivery.shutdown();
            Ok(())
        });

        let transport = connection.clone();
        registry.register("connection", PRIORITY_CONNECTION, move || async move {
            transport.shutdown().await;
            Ok(())
        });

        let credentials = provider.clone();
        registry.register("credentials", PRIORITY_CREDENTIALS, move || async move {
            credentials.clear();
            Ok(())
        });

        let weak = Arc::downgrade(self);
        let states = Forwarder::spawn(connection.subscribe_state(), move |next| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_state(generation, next);
            }
        });
        registry.register("connection-events", PRIORITY_FORWARDERS, move || {
            states.finish()
        });

        let weak = Arc::downgrade(self);
        let deliveries = Forwarder::spawn(engine.subscribe(), move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_delivery_event(generation, event);
            }
        });
        registry.register("delivery-events", PRIORITY_FORWARDERS, move || {
            deliveries.finish()
        });

        registry
    }

    async fn establish(
        &self,
        generation: u64,
        identity: &LocalIdentity,
        provider: &CredentialProvider,
        connection: &ConnectionManager,
    ) -> Result<(), SessionError> {
        let credential = provider.get_valid_credential(&identity.id).await?;
        {
            let mut state = lock(&self.state);
            if !state.owns(generation) {
                return Err(superseded());
            }
            state.snapshot.room_name = Some(credential.room_name.clone());
            self.publish(&mut state);
        }

        connection.connect(ConnectTarget::from(&credential)).await?;
        Ok(())
    }

    /// Spawns the teardown of `active` and records it as the in-flight end.
    /// `phase` is the phase the session settles in once cleanup finished.
    fn begin_teardown(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        active: ActiveSession,
        phase: SessionPhase,
    ) -> SharedEnd {
        let inner = self.clone();
        let task = tokio::spawn(async move {
            let report = active.registry.run_all().await;
            inner.finish_end(active.generation, phase, &report);
        });
        let weak = Arc::downgrade(self);
        let ending = async move {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "session teardown task failed");
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.state).ending = None;
                }
            }
        }
        .boxed()
        .shared();
        state.ending = Some(ending.clone());
        ending
    }

    fn take_active(&self, generation: u64) -> Option<ActiveSession> {
        let mut state = lock(&self.state);
        if state.owns(generation) {
            state.active.take()
        } else {
            None
        }
    }

    fn finish_end(&self, generation: u64, phase: SessionPhase, report: &CleanupReport) {
        {
            let mut state = lock(&self.state);
            state.ending = None;
            if state.generation == generation {
                state.snapshot.phase = phase;
                state.snapshot.connection = ConnectionState::Disconnected;
                state.snapshot.remote_typing = false;
                self.publish(&mut state);
            }
        }
        log_report(report);
        tracing::info!(generation, phase = ?phase, "session ended");
    }

    /// Mirrors connection state into the snapshot.
    ///
    /// Reaching `disconnected` while active means the transport gave up or
    /// the server closed the session: nothing will reconnect it, so the
    /// session fails and is torn down, which resolves every unsent message
    /// to a terminal status.
    fn on_connection_state(self: &Arc<Self>, generation: u64, next: ConnectionState) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return;
        }
        state.snapshot.connection = next;

        if next == ConnectionState::Disconnected && state.snapshot.phase == SessionPhase::Active {
            let error = SessionError::Network("connection lost and could not be restored".to_string());
            tracing::warn!("{}", error);
            let event = ErrorEvent::new(&error, self.deps.clock.now_ms());
            state.snapshot.phase = SessionPhase::Failed;
            state.snapshot.remote_typing = false;
            state.snapshot.last_error = Some(event.clone());
            self.publish(&mut state);
            let _ = self.errors.send(event);

            if let Some(active) = state.active.take() {
                let _ = self.begin_teardown(&mut state, active, SessionPhase::Failed);
            }
            return;
        }
        self.publish(&mut state);
    }

    fn on_delivery_event(&self, generation: u64, event: DeliveryEvent) {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return;
        }
        match event {
            DeliveryEvent::TypingChanged { is_typing, .. } => {
                state.snapshot.remote_typing = is_typing;
                self.publish(&mut state);
            }
            DeliveryEvent::Error(error) => {
                state.snapshot.last_error = Some(error.clone());
                self.publish(&mut state);
                let _ = self.errors.send(error);
            }
            other => {
                let _ = self.messages.send(other);
            }
        }
    }
}

fn superseded() -> SessionError {
    SessionError::InvalidState("session was ended before it finished starting".to_string())
}

fn log_report(report: &CleanupReport) {
    if report.is_clean() {
        tracing::debug!(cleanups = report.total(), "session teardown complete");
    } else {
        tracing::warn!(
            cleanups = report.total(),
            failed = ?report.failed,
            "session teardown finished with failures"
        );
    }
}

/// Relays one broadcast stream into a handler until told to stop.
///
/// Stopping drains whatever is already buffered first, so events emitted by
/// earlier teardown steps are still observed.
struct Forwarder {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Forwarder {
    fn spawn<T, F>(mut rx: broadcast::Receiver<T>, mut handle: F) -> Self
    where
        T: Clone + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(event) => handle(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "session event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = &mut stopped => {
                        while let Ok(event) = rx.try_recv() {
                            handle(event);
                        }
                        return;
                    }
                }
            }
        });
        Self { stop, task }
    }

    async fn finish(self) -> Result<(), CleanupError> {
        let _ = self.stop.send(());
        self.task.await.map_err(CleanupError::new)
    }
}
