//! Reliable chat delivery over the transport's raw data channel.
//!
//! The data channel may not exist yet, may drop at any moment, and never
//! acknowledges anything. [`DeliveryEngine`] layers on top of it:
//!
//! - an outbound queue with per-message timeouts, retry with backoff, and
//!   an attempt budget, flushed oldest-first whenever the connection is up;
//! - application-level delivery receipts, with optimistic promotion to
//!   `delivered` once a confirmation window passes without one;
//! - inbound validation and deduplication against a bounded history;
//! - edge-triggered typing indicators with an inactivity timeout.

pub mod config;
pub mod engine;
pub mod events;
pub mod history;
pub mod queue;

pub use config::DeliverySettings;
pub use engine::{DeliveryEngine, LocalIdentity};
pub use events::DeliveryEvent;
pub use history::MessageHistory;
pub use queue::{MessagePriority, OutboundQueue, QueuedMessage, SendOptions};
