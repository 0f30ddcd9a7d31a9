//! The directed follow edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::now_millis;

/// Kind of follow relationship.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowType {
    /// Regular follow.
    Standard,
    /// Close-friend designation.
    CloseFriend,
    /// Awaiting approval from a private account.
    Pending,
    /// Request sent, not yet acted on.
    Requested,
}

impl FollowType {
    /// Get the type as its stored string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::CloseFriend => "close_friend",
            Self::Pending => "pending",
            Self::Requested => "requested",
        }
    }

    /// Parse the stored string form; unknown values map to `Standard`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "close_friend" => Self::CloseFriend,
            "pending" => Self::Pending,
            "requested" => Self::Requested,
            _ => Self::Standard,
        }
    }
}

/// Edge-level visibility.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    /// Visible to everyone.
    Public,
    /// Visible to the subject only.
    Private,
    /// Visible to a restricted audience.
    Restricted,
}

impl PrivacyLevel {
    /// Get the level as its stored string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Restricted => "restricted",
        }
    }

    /// Parse the stored string form; unknown values map to `Public`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "private" => Self::Private,
            "restricted" => Self::Restricted,
            _ => Self::Public,
        }
    }
}

/// Notification preference for one edge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    /// Everything.
    All,
    /// Important activity only.
    Important,
    /// Mentions only.
    Mentions,
    /// Nothing.
    Off,
}

impl NotificationLevel {
    /// Get the level as its stored string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Important => "important",
            Self::Mentions => "mentions",
            Self::Off => "off",
        }
    }

    /// Parse the stored string form; unknown values map to `All`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "important" => Self::Important,
            "mentions" => Self::Mentions,
            "off" => Self::Off,
            _ => Self::All,
        }
    }
}

/// One directed follow edge.
///
/// At most one active edge exists per ordered `(follower, following)`
/// pair; a soft-deleted edge (`active = false`) is retained for analytics
/// but invisible to reads. Timestamps carry millisecond precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    /// Unique id of this edge.
    pub follow_id: Uuid,
    /// User doing the following.
    pub follower_id: String,
    /// User being followed.
    pub following_id: String,
    /// Relationship kind.
    pub follow_type: FollowType,
    /// When the edge was created.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Last change to the edge.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Last recorded interaction along the edge.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_interaction_at: Option<DateTime<Utc>>,
    /// When the edge was soft-deleted, if ever.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub unfollowed_at: Option<DateTime<Utc>>,
    /// Interactions recorded along the edge.
    pub interaction_count: u64,
    /// Engagement score in `[0, 100]`.
    pub engagement_score: f64,
    /// Edge visibility.
    pub privacy_level: PrivacyLevel,
    /// Follower muted the followed user.
    pub muted: bool,
    /// Show reposted content from this user.
    pub show_retweets: bool,
    /// Show replies from this user.
    pub show_replies: bool,
    /// Close-friend designation.
    pub close_friend: bool,
    /// Notification preference.
    pub notification_level: NotificationLevel,
    /// How the follow originated (api, search, recommendation, ...).
    pub source: String,
    /// Whether the edge is live.
    pub active: bool,
}

impl Follow {
    /// New active edge with default settings.
    #[must_use]
    pub fn new(follower_id: &str, following_id: &str, follow_type: FollowType, source: &str) -> Self {
        let now = now_millis();
        Self {
            follow_id: Uuid::new_v4(),
            follower_id: follower_id.to_string(),
            following_id: following_id.to_string(),
            follow_type,
            created_at: now,
            updated_at: now,
            last_interaction_at: None,
            unfollowed_at: None,
            interaction_count: 0,
            engagement_score: 0.0,
            privacy_level: PrivacyLevel::Public,
            muted: false,
            show_retweets: true,
            show_replies: true,
            close_friend: follow_type == FollowType::CloseFriend,
            notification_level: NotificationLevel::All,
            source: source.to_string(),
            active: true,
        }
    }

    /// Whether content from this edge should surface in timelines.
    #[must_use]
    pub const fn shows_content(&self) -> bool {
        self.active && !self.muted
    }

    /// Whether the follow happened within the last `hours` hours.
    #[must_use]
    pub fn is_recent(&self, hours: i64) -> bool {
        Utc::now() - self.created_at <= chrono::Duration::hours(hours)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_edge_defaults() {
        let follow = Follow::new("u_1", "u_2", FollowType::Standard, "api");
        assert!(follow.active);
        assert!(!follow.muted);
        assert!(follow.show_retweets);
        assert_eq!(follow.interaction_count, 0);
        assert_eq!(follow.engagement_score, 0.0);
        assert_eq!(follow.created_at, follow.updated_at);
        assert!(!follow.close_friend);
    }

    #[test]
    fn test_close_friend_type_sets_flag() {
        let follow = Follow::new("u_1", "u_2", FollowType::CloseFriend, "api");
        assert!(follow.close_friend);
    }

    #[test]
    fn test_json_round_trip_is_exact() {
        let mut follow = Follow::new("u_1", "u_2", FollowType::Standard, "recommendation");
        follow.last_interaction_at = Some(super::super::now_millis());
        follow.engagement_score = 42.5;

        let json = serde_json::to_string(&follow).unwrap();
        let back: Follow = serde_json::from_str(&json).unwrap();
        assert_eq!(follow, back, "millisecond timestamps survive the round trip");
    }

    #[test]
    fn test_enum_string_round_trips() {
        for t in [
            FollowType::Standard,
            FollowType::CloseFriend,
            FollowType::Pending,
            FollowType::Requested,
        ] {
            assert_eq!(FollowType::parse(t.as_str()), t);
        }
        for p in [PrivacyLevel::Public, PrivacyLevel::Private, PrivacyLevel::Restricted] {
            assert_eq!(PrivacyLevel::parse(p.as_str()), p);
        }
        for n in [
            NotificationLevel::All,
            NotificationLevel::Important,
            NotificationLevel::Mentions,
            NotificationLevel::Off,
        ] {
            assert_eq!(NotificationLevel::parse(n.as_str()), n);
        }
    }

    #[test]
    fn test_unknown_enum_strings_fall_back() {
        assert_eq!(FollowType::parse("exotic"), FollowType::Standard);
        assert_eq!(PrivacyLevel::parse(""), PrivacyLevel::Public);
        assert_eq!(NotificationLevel::parse("loud"), NotificationLevel::All);
    }

    #[test]
    fn test_shows_content() {
        let mut follow = Follow::new("u_1", "u_2", FollowType::Standard, "api");
        assert!(follow.shows_content());
        follow.muted = true;
        assert!(!follow.shows_content());
        follow.muted = false;
        follow.active = false;
        assert!(!follow.shows_content());
    }
}
