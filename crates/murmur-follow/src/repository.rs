//! Durable follow storage (C8).
//!
//! Every statement goes through the cached executor: reads are cache-aside
//! and tagged with their table, writes invalidate that table on success.
//! Three tables are used: `follows` (one row per directed edge, soft
//! deleted), `blocks` and `mutes` (one row per actor/target record).
//!
//! Timestamps are stored as fixed-width RFC 3339 text with millisecond
//! precision, so `created_at` cursors order lexicographically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use murmur_db::cache::fingerprint;
use murmur_db::driver::{QueryKind, RowView};
use murmur_db::executor::CachedExecutor;
use murmur_error::{FollowError, MurmurError, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    format_timestamp, now_millis, parse_timestamp, Follow, FollowType, NotificationLevel,
    PrivacyLevel, Relationship,
};

/// Hard cap on page sizes at the storage layer.
const MAX_PAGE_SIZE: usize = 1000;

/// Insert column list shared by single and bulk upserts.
const FOLLOW_COLUMNS: &str = "follow_id, follower_id, following_id, follow_type, created_at, \
     updated_at, last_interaction_at, unfollowed_at, interaction_count, engagement_score, \
     privacy_level, muted, show_retweets, show_replies, close_friend, notification_level, \
     source, active";

/// Upsert action when the `(follower, following)` pair already exists:
/// reactivate and refresh.
const FOLLOW_UPSERT_ACTION: &str = "ON CONFLICT (follower_id, following_id) DO UPDATE SET \
     active = 't', follow_type = EXCLUDED.follow_type, updated_at = EXCLUDED.updated_at, \
     unfollowed_at = NULL, source = EXCLUDED.source";

const SQL_IS_FOLLOWING: &str =
    "SELECT follow_id FROM follows WHERE follower_id = $1 AND following_id = $2 AND active = 't'";
const SQL_GET_FOLLOW: &str =
    "SELECT * FROM follows WHERE follower_id = $1 AND following_id = $2 AND active = 't'";
const SQL_FOLLOWER_COUNT: &str =
    "SELECT COUNT(*) FROM follows WHERE following_id = $1 AND active = 't'";
const SQL_FOLLOWING_COUNT: &str =
    "SELECT COUNT(*) FROM follows WHERE follower_id = $1 AND active = 't'";
const SQL_REMOVE_FOLLOW: &str = "UPDATE follows SET active = 'f', unfollowed_at = $3, \
     updated_at = $3 WHERE follower_id = $1 AND following_id = $2 AND active = 't'";
const SQL_BLOCK_EXISTS: &str =
    "SELECT blocker_id FROM blocks WHERE blocker_id = $1 AND blocked_id = $2";
const SQL_MUTE_EXISTS: &str = "SELECT muter_id FROM mutes WHERE muter_id = $1 AND muted_id = $2";

/// One entry of a paginated user list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowListEntry {
    /// The listed user.
    pub user_id: String,
    /// When the relationship was created.
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub followed_at: Option<DateTime<Utc>>,
}

/// Cursor-paginated user list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowPage {
    /// Total matching rows (unpaginated).
    pub count: u64,
    /// This page, newest first.
    pub entries: Vec<FollowListEntry>,
    /// Cursor for the next page; feed back verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether more rows exist past this page.
    pub has_more: bool,
}

/// Per-target outcome of a bulk operation, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkEntry {
    /// Target user.
    pub target_id: String,
    /// Whether this target's operation applied.
    pub success: bool,
    /// Failure detail, when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a bulk follow/unfollow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkResult {
    /// Targets requested.
    pub total: usize,
    /// Targets applied.
    pub successful: usize,
    /// Targets rejected or missed.
    pub failed: usize,
    /// Per-target outcomes, preserving input order.
    pub results: Vec<BulkEntry>,
}

/// Aggregate social counters for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialMetrics {
    /// Subject user.
    pub user_id: String,
    /// Active followers.
    pub followers: u64,
    /// Active followees.
    pub following: u64,
    /// `followers / max(following, 1)`.
    pub follower_following_ratio: f64,
}

/// One day of follower movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyGrowth {
    /// Calendar date (`YYYY-MM-DD`).
    pub date: String,
    /// Followers gained that day.
    pub gained: u64,
    /// Followers lost that day.
    pub lost: u64,
}

/// Follower analytics over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerAnalytics {
    /// Subject user.
    pub user_id: String,
    /// Window length in days.
    pub period_days: u32,
    /// Day-by-day movement within the window, ascending by date.
    pub daily_growth: Vec<DailyGrowth>,
    /// Current active follower count.
    pub total_followers: u64,
    /// Current active following count.
    pub total_following: u64,
    /// Followers gained inside the window.
    pub gained_in_period: u64,
    /// Followers lost inside the window.
    pub lost_in_period: u64,
    /// Follow-source histogram for followers gained in the window.
    pub sources: HashMap<String, u64>,
    /// Mean daily net growth over the window.
    pub avg_daily_growth: f64,
    /// Gained-in-window over current followers (0.0 when no followers).
    pub growth_rate: f64,
}

/// Durable follow/relationship storage over the cached executor.
pub struct FollowRepository {
    executor: Arc<CachedExecutor>,
}

impl FollowRepository {
    /// Repository over an executor.
    #[must_use]
    pub fn new(executor: Arc<CachedExecutor>) -> Self {
        Self { executor }
    }

    /// Shared executor handle.
    #[must_use]
    pub fn executor(&self) -> Arc<CachedExecutor> {
        Arc::clone(&self.executor)
    }

    // ── Core follow operations ──────────────────────────────────────────

    /// Create (or reactivate) the edge `follower → following`.
    ///
    /// Idempotent under the unique pair constraint: re-following a
    /// soft-deleted or existing edge updates it in place.
    pub async fn create_follow(
        &self,
        follower: &str,
        following: &str,
        follow_type: FollowType,
        source: &str,
    ) -> Result<Follow, MurmurError> {
        validate_pair(follower, following)?;

        let model = Follow::new(follower, following, follow_type, source);
        let sql = format!(
            "INSERT INTO follows ({FOLLOW_COLUMNS}) VALUES ({}) {FOLLOW_UPSERT_ACTION}",
            follow_values_group(1)
        );
        let params = follow_values_params(&model);
        self.executor
            .execute(&sql, &params, QueryKind::Insert, "follows")
            .await?;

        self.invalidate_user_cache(follower);
        self.invalidate_user_cache(following);

        self.get_follow(follower, following)
            .await?
            .ok_or_else(|| {
                StoreError::InvariantViolation {
                    message: format!("upserted follow {follower} -> {following} not readable"),
                }
                .into()
            })
    }

    /// Soft-delete the edge `follower → following`.
    ///
    /// Returns `false` when no active edge existed.
    pub async fn remove_follow(&self, follower: &str, following: &str) -> Result<bool, MurmurError> {
        let now = format_timestamp(now_millis());
        let rows = self
            .executor
            .execute(
                SQL_REMOVE_FOLLOW,
                &params(&[follower, following, &now]),
                QueryKind::Update,
                "follows",
            )
            .await?;

        self.invalidate_user_cache(follower);
        self.invalidate_user_cache(following);
        Ok(rows.rows_affected() > 0)
    }

    /// Whether an active edge `follower → following` exists. Cache-aside.
    pub async fn is_following(&self, follower: &str, following: &str) -> Result<bool, MurmurError> {
        let rows = self
            .executor
            .execute(
                SQL_IS_FOLLOWING,
                &params(&[follower, following]),
                QueryKind::Select,
                "follows",
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Full active edge, or `None`.
    pub async fn get_follow(&self, follower: &str, following: &str) -> Result<Option<Follow>, MurmurError> {
        let rows = self
            .executor
            .execute(
                SQL_GET_FOLLOW,
                &params(&[follower, following]),
                QueryKind::Select,
                "follows",
            )
            .await?;
        Ok(rows.row(0).map(|row| follow_from_row(&row)))
    }

    // ── Relationship projection ─────────────────────────────────────────

    /// Bidirectional projection between two users from follow, block and
    /// mute lookups. Read paths prefer block semantics when an invariant
    /// violation (block alongside an active follow) is observed.
    pub async fn get_relationship(&self, user1: &str, user2: &str) -> Result<Relationship, MurmurError> {
        let forward = self.get_follow(user1, user2).await?;
        let backward = self.get_follow(user2, user1).await?;
        let blocked_12 = self.record_exists(SQL_BLOCK_EXISTS, user1, user2, "blocks").await?;
        let blocked_21 = self.record_exists(SQL_BLOCK_EXISTS, user2, user1, "blocks").await?;
        let muted_12 = self.record_exists(SQL_MUTE_EXISTS, user1, user2, "mutes").await?;
        let muted_21 = self.record_exists(SQL_MUTE_EXISTS, user2, user1, "mutes").await?;

        let mut rel = Relationship::between(user1, user2);
        rel.user1_follows_user2 = forward.is_some();
        rel.user2_follows_user1 = backward.is_some();
        rel.user1_blocked_user2 = blocked_12;
        rel.user2_blocked_user1 = blocked_21;
        rel.user1_muted_user2 = muted_12;
        rel.user2_muted_user1 = muted_21;

        // Block in a direction must imply no active follow there.
        if blocked_12 && rel.user1_follows_user2 {
            warn!(user1, user2, "block and active follow coexist; preferring block");
            rel.user1_follows_user2 = false;
        }
        if blocked_21 && rel.user2_follows_user1 {
            warn!(user1, user2, "block and active follow coexist; preferring block");
            rel.user2_follows_user1 = false;
        }

        rel.close_friends = matches!((&forward, &backward), (Some(f), Some(b)) if f.close_friend && b.close_friend)
            && rel.are_mutual_friends();

        rel.mutual_interactions = forward.as_ref().map_or(0, |f| f.interaction_count)
            + backward.as_ref().map_or(0, |f| f.interaction_count);
        rel.last_interaction_at = match (
            forward.and_then(|f| f.last_interaction_at),
            backward.and_then(|f| f.last_interaction_at),
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        Ok(rel)
    }

    // ── Lists ───────────────────────────────────────────────────────────

    /// Followers of `user`, newest first, cursor-paginated.
    ///
    /// The privacy filter drops non-public edges unless the requester is
    /// the subject themself.
    pub async fn get_followers(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
        requester: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.list_page(user, limit, cursor, requester, ListDirection::Followers)
            .await
    }

    /// Users `user` follows, newest first, cursor-paginated.
    pub async fn get_following(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
        requester: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.list_page(user, limit, cursor, requester, ListDirection::Following)
            .await
    }

    async fn list_page(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
        requester: Option<&str>,
        direction: ListDirection,
    ) -> Result<FollowPage, MurmurError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let (select_col, filter_col) = match direction {
            ListDirection::Followers => ("follower_id", "following_id"),
            ListDirection::Following => ("following_id", "follower_id"),
        };

        let mut sql = format!(
            "SELECT {select_col}, created_at FROM follows WHERE {filter_col} = $1 AND active = 't'"
        );
        let mut bind: Vec<String> = vec![user.to_string()];
        if requester != Some(user) {
            sql.push_str(" AND privacy_level = 'public'");
        }
        if let Some(cursor) = cursor {
            bind.push(cursor.to_string());
            sql.push_str(&format!(" AND created_at < ${}", bind.len()));
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {}", limit + 1));

        let rows = self
            .executor
            .execute(&sql, &bind, QueryKind::Select, "follows")
            .await?;

        let has_more = rows.len() > limit;
        let entries: Vec<FollowListEntry> = rows
            .iter()
            .take(limit)
            .map(|row| FollowListEntry {
                user_id: row.get_string(select_col),
                followed_at: parse_timestamp(&row.get_string("created_at")),
            })
            .collect();
        let next_cursor = if has_more {
            rows.row(limit - 1).map(|row| row.get_string("created_at"))
        } else {
            None
        };

        let count = match direction {
            ListDirection::Followers => self.get_follower_count(user).await?,
            ListDirection::Following => self.get_following_count(user).await?,
        };

        Ok(FollowPage {
            count,
            entries,
            next_cursor,
            has_more,
        })
    }

    // ── Bulk operations ─────────────────────────────────────────────────

    /// Follow many targets in one storage round trip (multi-row upsert).
    ///
    /// Invalid targets (self-follows, malformed ids) fail individually
    /// without blocking the rest. Per-target results preserve input order.
    pub async fn bulk_follow(
        &self,
        follower: &str,
        targets: &[String],
        follow_type: FollowType,
        source: &str,
    ) -> Result<BulkResult, MurmurError> {
        if !murmur_graph::engine::is_valid_user_id(follower) {
            return Err(FollowError::InvalidUserId {
                id: follower.to_string(),
            }
            .into());
        }

        let mut results = Vec::with_capacity(targets.len());
        let mut valid: Vec<&String> = Vec::with_capacity(targets.len());
        for target in targets {
            match validate_pair(follower, target) {
                Ok(()) => {
                    valid.push(target);
                    results.push(BulkEntry {
                        target_id: target.clone(),
                        success: true,
                        error: None,
                    });
                },
                Err(e) => results.push(BulkEntry {
                    target_id: target.clone(),
                    success: false,
                    error: Some(e.to_string()),
                }),
            }
        }

        if !valid.is_empty() {
            let mut groups = Vec::with_capacity(valid.len());
            let mut bind = Vec::with_capacity(valid.len() * FOLLOW_PARAMS_PER_ROW);
            for (i, target) in valid.iter().enumerate() {
                let model = Follow::new(follower, target, follow_type, source);
                groups.push(format!("({})", follow_values_group(i * FOLLOW_PARAMS_PER_ROW + 1)));
                bind.extend(follow_values_params(&model));
            }
            let sql = format!(
                "INSERT INTO follows ({FOLLOW_COLUMNS}) VALUES {} {FOLLOW_UPSERT_ACTION}",
                groups.join(", ")
            );
            self.executor
                .execute(&sql, &bind, QueryKind::Insert, "follows")
                .await?;

            self.invalidate_user_cache(follower);
            for target in &valid {
                self.invalidate_user_cache(target);
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        Ok(BulkResult {
            total: targets.len(),
            successful,
            failed: targets.len() - successful,
            results,
        })
    }

    /// Unfollow many targets. Targets without an active edge fail
    /// individually; per-target results preserve input order.
    pub async fn bulk_unfollow(&self, follower: &str, targets: &[String]) -> Result<BulkResult, MurmurError> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let outcome = match validate_pair(follower, target) {
                Err(e) => BulkEntry {
                    target_id: target.clone(),
                    success: false,
                    error: Some(e.to_string()),
                },
                Ok(()) => match self.remove_follow(follower, target).await {
                    Ok(true) => BulkEntry {
                        target_id: target.clone(),
                        success: true,
                        error: None,
                    },
                    Ok(false) => BulkEntry {
                        target_id: target.clone(),
                        success: false,
                        error: Some("not following".to_string()),
                    },
                    Err(e) => BulkEntry {
                        target_id: target.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    },
                },
            };
            results.push(outcome);
        }

        let successful = results.iter().filter(|r| r.success).count();
        Ok(BulkResult {
            total: targets.len(),
            successful,
            failed: targets.len() - successful,
            results,
        })
    }

    /// Active-edge membership for many targets in one round trip.
    pub async fn bulk_is_following(
        &self,
        follower: &str,
        targets: &[String],
    ) -> Result<HashMap<String, bool>, MurmurError> {
        let rows = self
            .executor
            .execute(
                "SELECT following_id FROM follows WHERE follower_id = $1 AND active = 't'",
                &params(&[follower]),
                QueryKind::Select,
                "follows",
            )
            .await?;
        let following: HashSet<String> = rows.iter().map(|row| row.get_string("following_id")).collect();
        Ok(targets
            .iter()
            .map(|t| (t.clone(), following.contains(t)))
            .collect())
    }

    /// Users following both `user1` and `user2`, sorted, truncated.
    pub async fn get_mutual_followers(
        &self,
        user1: &str,
        user2: &str,
        limit: usize,
    ) -> Result<Vec<String>, MurmurError> {
        let of = |user: String| async move {
            let rows = self
                .executor
                .execute(
                    "SELECT follower_id FROM follows WHERE following_id = $1 AND active = 't'",
                    &params(&[&user]),
                    QueryKind::Select,
                    "follows",
                )
                .await?;
            Ok::<HashSet<String>, MurmurError>(rows.iter().map(|r| r.get_string("follower_id")).collect())
        };
        let a = of(user1.to_string()).await?;
        let b = of(user2.to_string()).await?;
        let mut shared: Vec<String> = a.intersection(&b).cloned().collect();
        shared.sort();
        shared.truncate(limit.clamp(1, MAX_PAGE_SIZE));
        Ok(shared)
    }

    // ── Blocking & muting ───────────────────────────────────────────────

    /// Record a block. Removes both directed follow edges first so no
    /// reader observes "blocked and following" together.
    pub async fn block_user(&self, blocker: &str, blocked: &str) -> Result<bool, MurmurError> {
        validate_pair(blocker, blocked)?;

        // Edge removal precedes the block record (ordering contract).
        self.remove_follow(blocker, blocked).await?;
        self.remove_follow(blocked, blocker).await?;

        let now = format_timestamp(now_millis());
        self.executor
            .execute(
                "INSERT INTO blocks (blocker_id, blocked_id, created_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (blocker_id, blocked_id) DO NOTHING",
                &params(&[blocker, blocked, &now]),
                QueryKind::Insert,
                "blocks",
            )
            .await?;

        debug!(blocker, blocked, "block recorded");
        Ok(true)
    }

    /// Remove a block. Does not restore any previously removed follows.
    pub async fn unblock_user(&self, blocker: &str, blocked: &str) -> Result<bool, MurmurError> {
        let rows = self
            .executor
            .execute(
                "DELETE FROM blocks WHERE blocker_id = $1 AND blocked_id = $2",
                &params(&[blocker, blocked]),
                QueryKind::Delete,
                "blocks",
            )
            .await?;
        Ok(rows.rows_affected() > 0)
    }

    /// Record a mute and flag the edge (when one exists).
    pub async fn mute_user(&self, muter: &str, muted: &str) -> Result<bool, MurmurError> {
        validate_pair(muter, muted)?;
        let now = format_timestamp(now_millis());
        self.executor
            .execute(
                "INSERT INTO mutes (muter_id, muted_id, created_at) VALUES ($1, $2, $3) \
                 ON CONFLICT (muter_id, muted_id) DO NOTHING",
                &params(&[muter, muted, &now]),
                QueryKind::Insert,
                "mutes",
            )
            .await?;
        self.executor
            .execute(
                "UPDATE follows SET muted = 't', updated_at = $3 \
                 WHERE follower_id = $1 AND following_id = $2 AND active = 't'",
                &params(&[muter, muted, &now]),
                QueryKind::Update,
                "follows",
            )
            .await?;
        Ok(true)
    }

    /// Remove a mute and unflag the edge.
    pub async fn unmute_user(&self, muter: &str, muted: &str) -> Result<bool, MurmurError> {
        let now = format_timestamp(now_millis());
        let rows = self
            .executor
            .execute(
                "DELETE FROM mutes WHERE muter_id = $1 AND muted_id = $2",
                &params(&[muter, muted]),
                QueryKind::Delete,
                "mutes",
            )
            .await?;
        self.executor
            .execute(
                "UPDATE follows SET muted = 'f', updated_at = $3 \
                 WHERE follower_id = $1 AND following_id = $2 AND active = 't'",
                &params(&[muter, muted, &now]),
                QueryKind::Update,
                "follows",
            )
            .await?;
        Ok(rows.rows_affected() > 0)
    }

    /// Users blocked by `user`, newest first.
    pub async fn get_blocked_users(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.moderation_page("blocks", "blocker_id", "blocked_id", user, limit, cursor)
            .await
    }

    /// Users muted by `user`, newest first.
    pub async fn get_muted_users(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.moderation_page("mutes", "muter_id", "muted_id", user, limit, cursor)
            .await
    }

    async fn moderation_page(
        &self,
        table: &str,
        actor_col: &str,
        target_col: &str,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let mut sql =
            format!("SELECT {target_col}, created_at FROM {table} WHERE {actor_col} = $1");
        let mut bind: Vec<String> = vec![user.to_string()];
        if let Some(cursor) = cursor {
            bind.push(cursor.to_string());
            sql.push_str(&format!(" AND created_at < ${}", bind.len()));
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {}", limit + 1));

        let rows = self.executor.execute(&sql, &bind, QueryKind::Select, table).await?;
        let count_rows = self
            .executor
            .execute(
                &format!("SELECT COUNT(*) FROM {table} WHERE {actor_col} = $1"),
                &params(&[user]),
                QueryKind::Select,
                table,
            )
            .await?;

        let has_more = rows.len() > limit;
        let entries = rows
            .iter()
            .take(limit)
            .map(|row| FollowListEntry {
                user_id: row.get_string(target_col),
                followed_at: parse_timestamp(&row.get_string("created_at")),
            })
            .collect();
        let next_cursor = if has_more {
            rows.row(limit - 1).map(|row| row.get_string("created_at"))
        } else {
            None
        };

        Ok(FollowPage {
            count: count_rows.row(0).map_or(0, |r| r.get_int("count").max(0) as u64),
            entries,
            next_cursor,
            has_more,
        })
    }

    // ── Counters, metrics, analytics ────────────────────────────────────

    /// Active follower count. Cache-aside.
    pub async fn get_follower_count(&self, user: &str) -> Result<u64, MurmurError> {
        self.count(SQL_FOLLOWER_COUNT, user).await
    }

    /// Active following count. Cache-aside.
    pub async fn get_following_count(&self, user: &str) -> Result<u64, MurmurError> {
        self.count(SQL_FOLLOWING_COUNT, user).await
    }

    /// Read-through social counters for one user.
    pub async fn get_social_metrics(&self, user: &str) -> Result<SocialMetrics, MurmurError> {
        let followers = self.get_follower_count(user).await?;
        let following = self.get_following_count(user).await?;
        Ok(SocialMetrics {
            user_id: user.to_string(),
            followers,
            following,
            follower_following_ratio: followers as f64 / following.max(1) as f64,
        })
    }

    /// Follower analytics over the trailing `days`.
    pub async fn get_follower_analytics(&self, user: &str, days: u32) -> Result<FollowerAnalytics, MurmurError> {
        let days = days.clamp(1, 365);
        let cutoff = format_timestamp(now_millis() - chrono::Duration::days(i64::from(days)));

        let gained_rows = self
            .executor
            .execute(
                "SELECT created_at, source FROM follows \
                 WHERE following_id = $1 AND active = 't' AND created_at > $2",
                &params(&[user, &cutoff]),
                QueryKind::Select,
                "follows",
            )
            .await?;
        let lost_rows = self
            .executor
            .execute(
                "SELECT unfollowed_at FROM follows \
                 WHERE following_id = $1 AND active = 'f' AND unfollowed_at > $2",
                &params(&[user, &cutoff]),
                QueryKind::Select,
                "follows",
            )
            .await?;

        let mut days_map: HashMap<String, DailyGrowth> = HashMap::new();
        let mut sources: HashMap<String, u64> = HashMap::new();
        for row in gained_rows.iter() {
            let date = day_of(&row.get_string("created_at"));
            days_map
                .entry(date.clone())
                .or_insert_with(|| DailyGrowth {
                    date,
                    gained: 0,
                    lost: 0,
                })
                .gained += 1;
            *sources.entry(row.get_string("source")).or_default() += 1;
        }
        for row in lost_rows.iter() {
            let date = day_of(&row.get_string("unfollowed_at"));
            days_map
                .entry(date.clone())
                .or_insert_with(|| DailyGrowth {
                    date,
                    gained: 0,
                    lost: 0,
                })
                .lost += 1;
        }
        let mut daily_growth: Vec<DailyGrowth> = days_map.into_values().collect();
        daily_growth.sort_by(|a, b| a.date.cmp(&b.date));

        let gained_in_period = gained_rows.len() as u64;
        let lost_in_period = lost_rows.len() as u64;
        let total_followers = self.get_follower_count(user).await?;
        let total_following = self.get_following_count(user).await?;

        Ok(FollowerAnalytics {
            user_id: user.to_string(),
            period_days: days,
            daily_growth,
            total_followers,
            total_following,
            gained_in_period,
            lost_in_period,
            sources,
            avg_daily_growth: (gained_in_period as f64 - lost_in_period as f64) / f64::from(days),
            growth_rate: if total_followers == 0 {
                0.0
            } else {
                gained_in_period as f64 / total_followers as f64
            },
        })
    }

    /// Record one interaction along an active edge, bumping its counters
    /// and engagement. Returns `false` when no active edge exists.
    pub async fn record_interaction(
        &self,
        follower: &str,
        following: &str,
        kind: &str,
    ) -> Result<bool, MurmurError> {
        let now = format_timestamp(now_millis());
        let rows = self
            .executor
            .execute(
                "UPDATE follows SET interaction_count = interaction_count + 1, \
                 last_interaction_at = $3, updated_at = $3 \
                 WHERE follower_id = $1 AND following_id = $2 AND active = 't'",
                &params(&[follower, following, &now]),
                QueryKind::Update,
                "follows",
            )
            .await?;
        if rows.rows_affected() == 0 {
            return Ok(false);
        }

        // Engagement is read-modify-write; the score saturates at 100.
        if let Some(edge) = self.get_follow(follower, following).await? {
            let bumped = (edge.engagement_score + interaction_weight(kind)).min(100.0);
            self.executor
                .execute(
                    "UPDATE follows SET engagement_score = $3 \
                     WHERE follower_id = $1 AND following_id = $2 AND active = 't'",
                    &params(&[follower, following, &format!("{bumped}")]),
                    QueryKind::Update,
                    "follows",
                )
                .await?;
        }

        self.invalidate_user_cache(follower);
        self.invalidate_user_cache(following);
        Ok(true)
    }

    // ── Cache management ────────────────────────────────────────────────

    /// Drop the per-user cached reads (counts, membership, metrics).
    ///
    /// Write paths already invalidate by table through the executor; this
    /// targets the per-user keys for callers that mutate storage through
    /// another channel.
    pub fn invalidate_user_cache(&self, user: &str) {
        for sql in [SQL_FOLLOWER_COUNT, SQL_FOLLOWING_COUNT, SQL_IS_FOLLOWING, SQL_GET_FOLLOW] {
            let prefix = format!("{}|{}", fingerprint(sql), user);
            self.executor.invalidate_prefix(&prefix);
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn count(&self, sql: &'static str, user: &str) -> Result<u64, MurmurError> {
        let rows = self
            .executor
            .execute(sql, &params(&[user]), QueryKind::Select, "follows")
            .await?;
        Ok(rows.row(0).map_or(0, |r| r.get_int("count").max(0) as u64))
    }

    async fn record_exists(
        &self,
        sql: &'static str,
        actor: &str,
        target: &str,
        table: &'static str,
    ) -> Result<bool, MurmurError> {
        let rows = self
            .executor
            .execute(sql, &params(&[actor, target]), QueryKind::Select, table)
            .await?;
        Ok(!rows.is_empty())
    }
}

impl std::fmt::Debug for FollowRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowRepository").finish_non_exhaustive()
    }
}

#[derive(Copy, Clone)]
enum ListDirection {
    Followers,
    Following,
}

/// Parameters one upsert row consumes.
const FOLLOW_PARAMS_PER_ROW: usize = 9;

/// One `(...)` VALUES group for the follow upsert, with parameter numbers
/// starting at `first`. Must stay aligned with [`FOLLOW_COLUMNS`] and
/// [`follow_values_params`].
fn follow_values_group(first: usize) -> String {
    let p: Vec<String> = (0..FOLLOW_PARAMS_PER_ROW).map(|i| format!("${}", first + i)).collect();
    format!(
        "{id}, {follower}, {following}, {ftype}, {ts}, {ts}, NULL, NULL, 0, 0, {privacy}, 'f', 't', 't', {close}, {notif}, {source}, 't'",
        id = p[0],
        follower = p[1],
        following = p[2],
        ftype = p[3],
        ts = p[4],
        privacy = p[5],
        close = p[6],
        notif = p[7],
        source = p[8],
    )
}

fn follow_values_params(model: &Follow) -> Vec<String> {
    vec![
        model.follow_id.to_string(),
        model.follower_id.clone(),
        model.following_id.clone(),
        model.follow_type.as_str().to_string(),
        format_timestamp(model.created_at),
        model.privacy_level.as_str().to_string(),
        bool_text(model.close_friend).to_string(),
        model.notification_level.as_str().to_string(),
        model.source.clone(),
    ]
}

fn follow_from_row(row: &RowView<'_>) -> Follow {
    Follow {
        follow_id: Uuid::parse_str(&row.get_string("follow_id")).unwrap_or(Uuid::nil()),
        follower_id: row.get_string("follower_id"),
        following_id: row.get_string("following_id"),
        follow_type: FollowType::parse(&row.get_string("follow_type")),
        created_at: parse_timestamp(&row.get_string("created_at")).unwrap_or_else(now_millis),
        updated_at: parse_timestamp(&row.get_string("updated_at")).unwrap_or_else(now_millis),
        last_interaction_at: row.get_opt("last_interaction_at").and_then(parse_timestamp),
        unfollowed_at: row.get_opt("unfollowed_at").and_then(parse_timestamp),
        interaction_count: row.get_int("interaction_count").max(0) as u64,
        engagement_score: row.get_float("engagement_score"),
        privacy_level: PrivacyLevel::parse(&row.get_string("privacy_level")),
        muted: row.get_bool("muted"),
        show_retweets: row.get_bool("show_retweets"),
        show_replies: row.get_bool("show_replies"),
        close_friend: row.get_bool("close_friend"),
        notification_level: NotificationLevel::parse(&row.get_string("notification_level")),
        source: row.get_string("source"),
        active: row.get_bool("active"),
    }
}

fn validate_pair(actor: &str, target: &str) -> Result<(), FollowError> {
    if !murmur_graph::engine::is_valid_user_id(actor) {
        return Err(FollowError::InvalidUserId { id: actor.to_string() });
    }
    if !murmur_graph::engine::is_valid_user_id(target) {
        return Err(FollowError::InvalidUserId { id: target.to_string() });
    }
    if actor == target {
        return Err(FollowError::SelfFollow);
    }
    Ok(())
}

const fn bool_text(value: bool) -> &'static str {
    if value {
        "t"
    } else {
        "f"
    }
}

fn interaction_weight(kind: &str) -> f64 {
    match kind {
        "reply" | "comment" => 2.0,
        "share" | "renote" => 3.0,
        _ => 1.0,
    }
}

fn day_of(timestamp: &str) -> String {
    timestamp.chars().take(10).collect()
}

/// Owned parameter list from borrowed strings.
fn params(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}
