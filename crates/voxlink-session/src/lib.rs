//! One voice-and-chat session with a remote agent.
//!
//! [`SessionCoordinator`] is the only surface presentation code talks to.
//! Each [`SessionCoordinator::start`] builds a fresh credential provider,
//! connection manager and delivery engine, registers their teardown with a
//! [`LifecycleRegistry`](voxlink_runtime::LifecycleRegistry), and merges
//! their events into three streams: session snapshots, message events, and
//! errors.

pub mod config;
pub mod coordinator;
pub mod snapshot;

pub use config::{load_config, Config, ConfigError, LoggingConfig};
pub use coordinator::{SessionCoordinator, SessionDeps, StartOptions};
pub use snapshot::{SessionPhase, SessionSnapshot};
