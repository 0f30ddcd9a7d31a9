//! Domain models for follow relationships.

mod follow;
mod relationship;

pub use follow::{Follow, FollowType, NotificationLevel, PrivacyLevel};
pub use relationship::Relationship;

use chrono::{DateTime, TimeZone, Utc};

/// Current time truncated to millisecond precision.
///
/// All stored and serialized timestamps in this crate are milliseconds;
/// truncating at creation keeps serialize/deserialize round-trips exact.
#[must_use]
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Timestamp text format used in storage (`created_at` cursors sort
/// lexicographically in this form).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Render a timestamp in the storage text format.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp from the storage text format; `None` on junk.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = now_millis();
        let text = format_timestamp(now);
        assert_eq!(parse_timestamp(&text), Some(now));
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = format_timestamp(parse_timestamp("2024-01-02T03:04:05.006Z").expect("parses"));
        let late = format_timestamp(parse_timestamp("2024-11-02T03:04:05.006Z").expect("parses"));
        assert!(early < late);
    }
}
