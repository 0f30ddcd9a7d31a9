//! Bidirectional relationship projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived view of everything between two users.
///
/// Invariants enforced at the repository: a block in one direction implies
/// no active follow in that direction, and `close_friends` only holds when
/// the follows are mutual.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// First user (the perspective user for the status label).
    pub user1_id: String,
    /// Second user.
    pub user2_id: String,

    /// `user1` follows `user2`.
    pub user1_follows_user2: bool,
    /// `user2` follows `user1`.
    pub user2_follows_user1: bool,
    /// `user1` blocked `user2`.
    pub user1_blocked_user2: bool,
    /// `user2` blocked `user1`.
    pub user2_blocked_user1: bool,
    /// `user1` muted `user2`.
    pub user1_muted_user2: bool,
    /// `user2` muted `user1`.
    pub user2_muted_user1: bool,

    /// Both edges carry the close-friend flag.
    pub close_friends: bool,

    /// Interactions summed over both directions.
    pub mutual_interactions: u64,
    /// Most recent interaction in either direction.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_interaction_at: Option<DateTime<Utc>>,
}

impl Relationship {
    /// Empty projection between two users.
    #[must_use]
    pub fn between(user1_id: &str, user2_id: &str) -> Self {
        Self {
            user1_id: user1_id.to_string(),
            user2_id: user2_id.to_string(),
            ..Self::default()
        }
    }

    /// Both users follow each other.
    #[must_use]
    pub const fn are_mutual_friends(&self) -> bool {
        self.user1_follows_user2 && self.user2_follows_user1
    }

    /// A block exists in either direction.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        self.user1_blocked_user2 || self.user2_blocked_user1
    }

    /// Single status label from `user1`'s perspective, by priority:
    /// blocked > mutual > `close_friends` > following > `followed_by` >
    /// muted > none.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        if self.is_blocked() {
            "blocked"
        } else if self.are_mutual_friends() {
            "mutual"
        } else if self.close_friends {
            "close_friends"
        } else if self.user1_follows_user2 {
            "following"
        } else if self.user2_follows_user1 {
            "followed_by"
        } else if self.user1_muted_user2 || self.user2_muted_user1 {
            "muted"
        } else {
            "none"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_priority_blocked_beats_everything() {
        let mut rel = Relationship::between("u_1", "u_2");
        rel.user1_follows_user2 = true;
        rel.user2_follows_user1 = true;
        rel.user1_blocked_user2 = true;
        assert_eq!(rel.status_label(), "blocked");
    }

    #[test]
    fn test_status_mutual() {
        let mut rel = Relationship::between("u_1", "u_2");
        rel.user1_follows_user2 = true;
        rel.user2_follows_user1 = true;
        assert_eq!(rel.status_label(), "mutual");
        assert!(rel.are_mutual_friends());
    }

    #[test]
    fn test_status_directional() {
        let mut rel = Relationship::between("u_1", "u_2");
        rel.user1_follows_user2 = true;
        assert_eq!(rel.status_label(), "following");

        let mut rel = Relationship::between("u_1", "u_2");
        rel.user2_follows_user1 = true;
        assert_eq!(rel.status_label(), "followed_by");
    }

    #[test]
    fn test_status_muted_and_none() {
        let mut rel = Relationship::between("u_1", "u_2");
        assert_eq!(rel.status_label(), "none");
        rel.user2_muted_user1 = true;
        assert_eq!(rel.status_label(), "muted");
    }

    #[test]
    fn test_json_round_trip() {
        let mut rel = Relationship::between("u_1", "u_2");
        rel.user1_follows_user2 = true;
        rel.mutual_interactions = 7;

        let json = serde_json::to_string(&rel).expect("serializable");
        let back: Relationship = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(rel, back);
    }
}
