use serde::Serialize;
use voxlink_types::{ConnectionState, ErrorEvent};

/// Where the session is in its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    Active,
    Ending,
    Ended,
    /// The session could not start, or lost its connection for good; see
    /// `last_error`.
    Failed,
}

impl SessionPhase {
    /// Whether a new `start` is allowed from this phase.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Failed)
    }
}

/// Merged view of a session, republished on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// Mirror of the connection manager's state.
    pub connection: ConnectionState,
    pub local_id: Option<String>,
    pub display_name: Option<String>,
    pub room_name: Option<String>,
    /// Whether the peer is currently typing.
    pub remote_typing: bool,
    pub last_error: Option<ErrorEvent>,
    /// Epoch milliseconds of the change that produced this snapshot.
    pub updated_at_ms: i64,
}
