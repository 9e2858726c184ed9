use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use voxlink_runtime::{lock, Clock, RetryPolicy, Scheduler, TimerHandle};
use voxlink_transport::{ConnectionError, ConnectionManager};
use voxlink_types::{
    decode_frame, ChatMessage, ConnectionState, ControlFrame, DeliveryStatus, ErrorEvent,
    SessionError, WireFrame,
};

use crate::config::DeliverySettings;
use crate::events::DeliveryEvent;
use crate::history::MessageHistory;
use crate::queue::{OutboundQueue, QueuedMessage, SendOptions};

const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Who this side of the conversation is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub name: Option<String>,
}

/// Reliable chat delivery over a [`ConnectionManager`]'s raw channel.
///
/// One worker task processes the outbound queue. Every trigger (a new
/// message, a retry timer, the connection coming back) only notifies the
/// worker, so wake-ups that arrive during a pass collapse into a single
/// follow-up pass and no message is ever attempted twice concurrently.
/// A second task pumps connection state changes and inbound payloads.
///
/// All timers go through one [`Scheduler`]; [`DeliveryEngine::shutdown`]
/// cancels them and resolves every undelivered message.
#[derive(Clone)]
pub struct DeliveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    connection: ConnectionManager,
    identity: LocalIdentity,
    settings: DeliverySettings,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    wake: Arc<Notify>,
    events: broadcast::Sender<DeliveryEvent>,
    state: Mutex<EngineState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineState {
    queue: OutboundQueue,
    history: MessageHistory,
    /// The live timer of each outbound message: retry, confirmation, or purge.
    timers: HashMap<String, TimerHandle>,
    local_typing: bool,
    typing_timer: Option<TimerHandle>,
    /// Peers currently typing, each with its expiry timer.
    remote_typing: HashMap<String, TimerHandle>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("DeliveryEngine")
            .field("identity", &self.inner.identity)
            .field("queued", &state.queue.len())
            .field("history", &state.history.len())
            .finish()
    }
}

impl DeliveryEngine {
    /// Attaches to `connection` and starts the engine's tasks.
    ///
    /// Must be called from within a tokio runtime. If the connection is
    /// already up, queued messages start flowing immediately.
    pub fn attach(
        connection: ConnectionManager,
        identity: LocalIdentity,
        settings: DeliverySettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let states = connection.subscribe_state();
        let inbound = connection.subscribe_raw();
        let wake = Arc::new(Notify::new());

        let inner = Arc::new(EngineInner {
            retry: settings.retry_policy(),
            state: Mutex::new(EngineState {
                queue: OutboundQueue::new(),
                history: MessageHistory::new(settings.history_limit),
                timers: HashMap::new(),
                local_typing: false,
                typing_timer: None,
                remote_typing: HashMap::new(),
            }),
            connection,
            identity,
            settings,
            clock,
            scheduler: Scheduler::new(),
            wake: wake.clone(),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let worker = tokio::spawn(run_worker(Arc::downgrade(&inner), wake.clone()));
        let pump = tokio::spawn(pump_connection(Arc::downgrade(&inner), states, inbound));
        lock(&inner.tasks).extend([worker, pump]);

        tracing::debug!(identity = %inner.identity.id, "delivery engine attached");
        wake.notify_one();
        Self { inner }
    }

    /// Subscribes to received messages, status changes, typing changes and
    /// delivery errors.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Queues `text` for delivery and returns the new message id without
    /// waiting for the send.
    pub fn send(&self, text: &str) -> Result<String, SessionError> {
        self.send_with_options(text, self.inner.settings.default_send_options())
    }

    pub fn send_with_options(
        &self,
        text: &str,
        options: SendOptions,
    ) -> Result<String, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::Validation(
                "message text must not be empty".to_string(),
            ));
        }
        if !self.inner.scheduler.is_alive() {
            return Err(SessionError::InvalidState(
                "delivery engine has been shut down".to_string(),
            ));
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: self.inner.identity.id.clone(),
            sender_name: self.inner.identity.name.clone(),
            text: text.to_string(),
            ts: self.inner.clock.now_ms(),
        };
        let payload = WireFrame::Chat(message.clone()).encode()?;
        let id = message.id.clone();

        {
            let mut state = lock(&self.inner.state);
            state.queue.push(message, payload, options, Instant::now());
            if let Some(entry) = state.queue.get(&id) {
                self.inner.emit(status_event(entry));
            }
        }

        tracing::debug!(message_id = %id, priority = ?options.priority, "message queued");
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Edge-triggered typing signal.
    ///
    /// Repeating the current value sends nothing. While typing, an automatic
    /// `false` is sent after the inactivity timeout; every further `true`
    /// pushes that timeout back.
    pub async fn set_typing(&self, is_typing: bool) {
        if let Some(frame) = self.inner.apply_local_typing(is_typing) {
            self.inner.publish_control(frame).await;
        }
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.inner.state).local_typing
    }

    /// Current view of an outbound message, until it is purged.
    pub fn message_status(&self, id: &str) -> Option<QueuedMessage> {
        lock(&self.inner.state).queue.get(id).cloned()
    }

    /// Sent and received messages, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.inner.state).history.to_vec()
    }

    /// Number of messages still waiting for the channel.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.state).queue.outstanding()
    }

    pub fn is_running(&self) -> bool {
        self.inner.scheduler.is_alive()
    }

    /// Stops the engine. Idempotent.
    ///
    /// Cancels every timer and stops both tasks. Messages that were never
    /// sent, or are waiting for a retry, become terminally `failed`;
    /// messages awaiting confirmation are promoted to `delivered`.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.scheduler.is_alive() {
            return;
        }
        inner.scheduler.shutdown();
        for task in lock(&inner.tasks).drain(..) {
            task.abort();
        }

        let mut state = lock(&inner.state);
        state.timers.clear();
        state.typing_timer = None;
        state.remote_typing.clear();
        state.local_typing = false;

        let mut resolved = Vec::new();
        for entry in state.queue.iter_mut() {
            match entry.status {
                DeliveryStatus::Sent => entry.status = DeliveryStatus::Delivered,
                DeliveryStatus::Pending | DeliveryStatus::Failed if !entry.terminal => {
                    entry.status = DeliveryStatus::Failed;
                    entry.terminal = true;
                    entry.retry_at = None;
                }
                _ => continue,
            }
            resolved.push(status_event(entry));
        }

        tracing::info!(resolved = resolved.len(), "delivery engine drained");
        for event in resolved {
            inner.emit(event);
        }
    }
}

impl EngineInner {
    fn emit(&self, event: DeliveryEvent) {
        let _ = self.events.send(event);
    }

    /// One pass over the queue. Only ever run by the worker task.
    async fn process_queue(self: &Arc<Self>) {
        if !self.connection.is_connected() {
            tracing::debug!(state = %self.connection.state(), "channel offline, flush deferred");
            return;
        }

        let batch = lock(&self.state).queue.eligible(Instant::now());
        for id in batch {
            if !self.scheduler.is_alive() {
                return;
            }
            let Some((payload, timeout, attempt)) = self.begin_attempt(&id) else {
                continue;
            };

            tracing::debug!(message_id = %id, attempt, "sending message");
            match tokio::time::timeout(timeout, self.connection.send_raw(&payload)).await {
                Ok(Ok(())) => self.on_sent(&id),
                Ok(Err(ConnectionError::NotConnected(state))) => {
                    self.defer_attempt(&id);
                    tracing::debug!(message_id = %id, %state, "channel went offline mid-flush");
                    return;
                }
                Ok(Err(e)) => self.on_attempt_failed(&id, &e.to_string()),
                Err(_) => self.on_attempt_failed(
                    &id,
                    &format!("send timed out after {}ms", timeout.as_millis()),
                ),
            }
        }
    }

    /// Counts an attempt and hands back what to send.
    fn begin_attempt(&self, id: &str) -> Option<(Vec<u8>, Duration, u32)> {
        let mut state = lock(&self.state);
        let entry = state.queue.get_mut(id)?;
        if !entry.is_eligible(Instant::now()) {
            return None;
        }
        entry.attempts += 1;
        Some((entry.payload().to_vec(), entry.options.timeout, entry.attempts))
    }

    /// Takes back an attempt that never reached the channel.
    fn defer_attempt(&self, id: &str) {
        if let Some(entry) = lock(&self.state).queue.get_mut(id) {
            entry.attempts = entry.attempts.saturating_sub(1);
        }
    }

    fn on_sent(self: &Arc<Self>, id: &str) {
        let mut state = lock(&self.state);
        let Some(entry) = state.queue.get_mut(id) else {
            return;
        };
        // A receipt may have overtaken the send result.
        if entry.status == DeliveryStatus::Delivered {
            return;
        }
        entry.status = DeliveryStatus::Sent;
        entry.retry_at = None;
        let event = status_event(entry);
        let message = entry.message.clone();

        state.history.insert(message);
        self.emit(event);

        let weak = Arc::downgrade(self);
        let key = id.to_string();
        let timer = self
            .scheduler
            .schedule(self.settings.confirm_window(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.promote_delivered(&key, "confirmation window elapsed");
                }
            });
        replace_timer(&mut state, id, timer);
    }

    fn on_attempt_failed(self: &Arc<Self>, id: &str, reason: &str) {
        let now_ms = self.clock.now_ms();
        let mut state = lock(&self.state);
        let Some(entry) = state.queue.get_mut(id) else {
            return;
        };
        entry.status = DeliveryStatus::Failed;
        let attempts = entry.attempts;

        if attempts >= self.retry.max_attempts() {
            entry.terminal = true;
            entry.retry_at = None;
            let event = status_event(entry);
            tracing::warn!(message_id = %id, attempts, reason, "message delivery exhausted");
            self.emit(event);

            let error = SessionError::DeliveryExhausted {
                message_id: id.to_string(),
                attempts,
            };
            self.emit(DeliveryEvent::Error(ErrorEvent::new(&error, now_ms)));

            let timer = self.schedule_purge(id, self.settings.failed_grace());
            replace_timer(&mut state, id, timer);
            return;
        }

        let delay = self.retry.delay_for_attempt(attempts.saturating_sub(1));
        entry.retry_at = Some(Instant::now() + delay);
        let event = status_event(entry);
        tracing::debug!(
            message_id = %id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            reason,
            "send attempt failed, retrying"
        );
        self.emit(event);

        let wake = self.wake.clone();
        let timer = self.scheduler.schedule(delay, move || async move {
            wake.notify_one();
        });
        replace_timer(&mut state, id, timer);
    }

    fn promote_delivered(self: &Arc<Self>, id: &str, cause: &'static str) {
        let mut state = lock(&self.state);
        let Some(entry) = state.queue.get_mut(id) else {
            tracing::debug!(message_id = %id, cause, "delivery confirmation for unknown message");
            return;
        };
        if entry.status == DeliveryStatus::Delivered {
            return;
        }
        entry.status = DeliveryStatus::Delivered;
        entry.terminal = false;
        entry.retry_at = None;
        let event = status_event(entry);
        let message = entry.message.clone();

        state.history.insert(message);
        tracing::debug!(message_id = %id, cause, "message delivered");
        self.emit(event);

        let timer = self.schedule_purge(id, self.settings.cleanup_grace());
        replace_timer(&mut state, id, timer);
    }

    fn schedule_purge(self: &Arc<Self>, id: &str, after: Duration) -> TimerHandle {
        let weak = Arc::downgrade(self);
        let key = id.to_string();
        self.scheduler.schedule(after, move || async move {
            if let Some(inner) = weak.upgrade() {
                let mut state = lock(&inner.state);
                state.queue.remove(&key);
                state.timers.remove(&key);
                tracing::trace!(message_id = %key, "purged outbound message");
            }
        })
    }

    async fn handle_inbound(self: &Arc<Self>, payload: &[u8]) {
        let frame = match decode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(bytes = payload.len(), error = %e, "dropping malformed payload");
                return;
            }
        };

        match frame {
            WireFrame::Control(ControlFrame::DeliveryReceipt { message_id, .. }) => {
                self.promote_delivered(&message_id, "receipt");
            }
            WireFrame::Control(ControlFrame::TypingIndicator {
                sender_id,
                is_typing,
                ..
            }) => self.on_remote_typing(sender_id, is_typing),
            WireFrame::Chat(message) => self.on_chat(message).await,
        }
    }

    async fn on_chat(self: &Arc<Self>, message: ChatMessage) {
        let from_peer = message.sender_id != self.identity.id;
        let fresh = lock(&self.state).history.insert(message.clone());

        if fresh {
            if from_peer {
                self.clear_remote_typing(&message.sender_id);
            }
            tracing::debug!(message_id = %message.id, "chat message received");
            self.emit(DeliveryEvent::MessageReceived(message.clone()));
        } else {
            tracing::debug!(message_id = %message.id, "duplicate chat message ignored");
        }

        // Duplicates are acknowledged again: the peer resends only when it
        // missed the first receipt.
        if from_peer {
            let receipt = ControlFrame::DeliveryReceipt {
                message_id: message.id,
                ts: self.clock.now_ms(),
            };
            self.publish_control(receipt).await;
        }
    }

    fn on_remote_typing(self: &Arc<Self>, sender_id: String, is_typing: bool) {
        if sender_id == self.identity.id {
            return;
        }
        let mut state = lock(&self.state);
        if !is_typing {
            if let Some(timer) = state.remote_typing.remove(&sender_id) {
                timer.cancel();
                self.emit(DeliveryEvent::TypingChanged {
                    sender_id,
                    is_typing: false,
                });
            }
            return;
        }

        let weak = Arc::downgrade(self);
        let key = sender_id.clone();
        let timer = self
            .scheduler
            .schedule(self.settings.typing_timeout(), move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.clear_remote_typing(&key);
                }
            });
        match state.remote_typing.insert(sender_id.clone(), timer) {
            Some(previous) => previous.cancel(),
            None => self.emit(DeliveryEvent::TypingChanged {
                sender_id,
                is_typing: true,
            }),
        }
    }

    fn clear_remote_typing(&self, sender_id: &str) {
        let removed = lock(&self.state).remote_typing.remove(sender_id);
        if let Some(timer) = removed {
            timer.cancel();
            self.emit(DeliveryEvent::TypingChanged {
                sender_id: sender_id.to_string(),
                is_typing: false,
            });
        }
    }

    /// Updates local typing state and returns the signal to send, if the
    /// value changed.
    fn apply_local_typing(self: &Arc<Self>, is_typing: bool) -> Option<ControlFrame> {
        if !self.scheduler.is_alive() {
            return None;
        }
        let mut state = lock(&self.state);
        if let Some(timer) = state.typing_timer.take() {
            timer.cancel();
        }
        if is_typing {
            let weak = Arc::downgrade(self);
            state.typing_timer = Some(self.scheduler.schedule(
                self.settings.typing_timeout(),
                move || async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    tracing::debug!("typing timed out");
                    if let Some(frame) = inner.apply_local_typing(false) {
                        inner.publish_control(frame).await;
                    }
                },
            ));
        }

        if state.local_typing == is_typing {
            return None;
        }
        state.local_typing = is_typing;
        Some(ControlFrame::TypingIndicator {
            sender_id: self.identity.id.clone(),
            is_typing,
            ts: self.clock.now_ms(),
        })
    }

    /// Best-effort send of a control frame. Control traffic is never queued.
    async fn publish_control(&self, frame: ControlFrame) {
        let payload = match WireFrame::Control(frame).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode control frame");
                return;
            }
        };
        if let Err(e) = self.connection.send_raw(&payload).await {
            tracing::debug!(error = %e, "control frame not sent");
        }
    }
}

fn status_event(entry: &QueuedMessage) -> DeliveryEvent {
    DeliveryEvent::StatusChanged {
        message_id: entry.message.id.clone(),
        status: entry.status,
        attempts: entry.attempts,
        terminal: entry.terminal,
    }
}

fn replace_timer(state: &mut EngineState, id: &str, timer: TimerHandle) {
    if let Some(previous) = state.timers.insert(id.to_string(), timer) {
        previous.cancel();
    }
}

async fn run_worker(engine: Weak<EngineInner>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        if !inner.scheduler.is_alive() {
            break;
        }
        inner.process_queue().await;
    }
}

async fn pump_connection(
    engine: Weak<EngineInner>,
    mut states: broadcast::Receiver<ConnectionState>,
    mut inbound: broadcast::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            state = states.recv() => match state {
                Ok(ConnectionState::Connected) => {
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    inner.wake.notify_one();
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "connection state stream lagged");
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    inner.wake.notify_one();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            payload = inbound.recv() => match payload {
                Ok(payload) => {
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    inner.handle_inbound(&payload).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "inbound payload stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
