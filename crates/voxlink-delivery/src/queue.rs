//! Outbound message queue.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use voxlink_types::{ChatMessage, DeliveryStatus};

/// Relative importance of an outbound message.
///
/// Carried with the message and reported back to callers; it does not
/// reorder the queue, which always flushes oldest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    #[default]
    Normal,
    High,
}

/// Per-message send options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Upper bound on one send attempt.
    pub timeout: Duration,
    pub priority: MessagePriority,
}

/// An outbound message tracked until it is delivered or terminally failed.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: ChatMessage,
    pub status: DeliveryStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Set once a failed message will never be retried.
    pub terminal: bool,
    pub options: SendOptions,
    pub enqueued_at: Instant,
    /// Earliest instant a failed message may be retried.
    pub retry_at: Option<Instant>,
    payload: Vec<u8>,
    seq: u64,
}

impl QueuedMessage {
    /// The encoded wire frame, produced once at enqueue time.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the processor may attempt this message at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Failed => {
                !self.terminal && self.retry_at.map_or(true, |at| at <= now)
            }
            DeliveryStatus::Sent | DeliveryStatus::Delivered => false,
        }
    }

    /// Whether the message still needs the channel (not yet sent or retried).
    pub fn is_outstanding(&self) -> bool {
        matches!(self.status, DeliveryStatus::Pending | DeliveryStatus::Failed) && !self.terminal
    }
}

/// Keyed queue of outbound messages, flushed in enqueue order.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: HashMap<String, QueuedMessage>,
    next_seq: u64,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `message` in `pending` status together with its encoded frame.
    pub fn push(
        &mut self,
        message: ChatMessage,
        payload: Vec<u8>,
        options: SendOptions,
        now: Instant,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            message.id.clone(),
            QueuedMessage {
                message,
                status: DeliveryStatus::Pending,
                attempts: 0,
                terminal: false,
                options,
                enqueued_at: now,
                retry_at: None,
                payload,
                seq,
            },
        );
    }

    /// Ids of every message eligible for an attempt at `now`, oldest first.
    ///
    /// Ordering uses the original enqueue instant, never the retry count.
    pub fn eligible(&self, now: Instant) -> Vec<String> {
        let mut ready: Vec<&QueuedMessage> = self
            .entries
            .values()
            .filter(|entry| entry.is_eligible(now))
            .collect();
        ready.sort_by_key(|entry| (entry.enqueued_at, entry.seq));
        ready
            .into_iter()
            .map(|entry| entry.message.id.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&QueuedMessage> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut QueuedMessage> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<QueuedMessage> {
        self.entries.remove(id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut QueuedMessage> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of messages that still need the channel.
    pub fn outstanding(&self) -> usize {
        self.entries.values().filter(|e| e.is_outstanding()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_id: "me".to_string(),
            sender_name: None,
            text: "hi".to_string(),
            ts: 0,
        }
    }

    fn options() -> SendOptions {
        SendOptions {
            timeout: Duration::from_secs(5),
            priority: MessagePriority::Normal,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eligible_is_oldest_first_regardless_of_retries() {
        let mut queue = OutboundQueue::new();
        let t0 = Instant::now();
        queue.push(message("a"), Vec::new(), options(), t0);
        queue.push(message("b"), Vec::new(), options(), t0 + Duration::from_millis(10));
        queue.push(message("c"), Vec::new(), options(), t0 + Duration::from_millis(20));

        // "a" has been retried twice and is due again; it still goes first.
        let a = queue.get_mut("a").unwrap();
        a.status = DeliveryStatus::Failed;
        a.attempts = 2;
        a.retry_at = Some(t0);

        let now = t0 + Duration::from_millis(30);
        assert_eq!(queue.eligible(now), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn same_instant_keeps_insertion_order() {
        let mut queue = OutboundQueue::new();
        let t0 = Instant::now();
        for id in ["x", "y", "z"] {
            queue.push(message(id), Vec::new(), options(), t0);
        }
        assert_eq!(queue.eligible(t0), vec!["x", "y", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_terminal_and_sent_are_not_eligible() {
        let mut queue = OutboundQueue::new();
        let t0 = Instant::now();
        for id in ["waiting", "dead", "sent", "fresh"] {
            queue.push(message(id), Vec::new(), options(), t0);
        }

        let waiting = queue.get_mut("waiting").unwrap();
        waiting.status = DeliveryStatus::Failed;
        waiting.retry_at = Some(t0 + Duration::from_secs(1));

        let dead = queue.get_mut("dead").unwrap();
        dead.status = DeliveryStatus::Failed;
        dead.terminal = true;

        queue.get_mut("sent").unwrap().status = DeliveryStatus::Sent;

        assert_eq!(queue.eligible(t0), vec!["fresh"]);
        assert_eq!(
            queue.eligible(t0 + Duration::from_secs(1)),
            vec!["waiting", "fresh"]
        );
        assert_eq!(queue.outstanding(), 2);
    }
}
