//! Relationship update events.
//!
//! The service emits one event per successful mutation; delivery (fan-out,
//! notifications, websockets) belongs to the transport layer and is out of
//! scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened between two users.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipEventKind {
    /// An edge was created or reactivated.
    Follow,
    /// An edge was soft-deleted.
    Unfollow,
    /// A block was recorded.
    Block,
    /// A block was removed.
    Unblock,
    /// A mute was recorded.
    Mute,
    /// A mute was removed.
    Unmute,
}

impl RelationshipEventKind {
    /// Get the kind as its wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
        }
    }
}

/// One relationship update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipEvent {
    /// User who acted.
    pub actor: String,
    /// User acted upon.
    pub target: String,
    /// What happened.
    pub kind: RelationshipEventKind,
    /// When the mutation committed.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub occurred_at: DateTime<Utc>,
}

/// Receiver for relationship events. Implementations must not block.
pub trait RelationshipEventSink: Send + Sync {
    /// Deliver one event.
    fn relationship_event(&self, event: &RelationshipEvent);
}
