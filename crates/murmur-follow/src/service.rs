//! Follow-service orchestration (C9).
//!
//! The service sits between the transport layer (out of scope; inputs are
//! presumed authenticated) and the repository + graph pair. It validates
//! inputs, enforces rate limits and block rules, mirrors every durable
//! mutation into the in-memory graph, and emits one relationship event per
//! successful mutation.
//!
//! The graph is updated first and rolled back if the repository write
//! fails, so the mirror never stays ahead of storage after an error
//! surfaces.

use std::sync::Arc;

use murmur_error::{FollowError, MurmurError, ResponseEnvelope};
use murmur_graph::{Recommendation, RecommendationAlgorithm, SocialGraph};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::events::{RelationshipEvent, RelationshipEventKind, RelationshipEventSink};
use crate::models::{now_millis, Follow, FollowType, Relationship};
use crate::rate_limit::{KeyedRateLimiter, RateLimitConfig};
use crate::repository::{BulkResult, FollowPage, FollowRepository, FollowerAnalytics, SocialMetrics};

/// Largest batch accepted by bulk operations.
pub const MAX_BULK_OPERATIONS: usize = 100;
/// Largest page accepted by list operations.
pub const MAX_LIST_LIMIT: usize = 200;
/// Largest recommendation set per request.
pub const MAX_RECOMMENDATIONS: usize = 50;

/// Relationship projection plus its derived status label.
#[derive(Debug, Clone, Serialize)]
pub struct RelationshipView {
    /// The bidirectional projection.
    #[serde(flatten)]
    pub relationship: Relationship,
    /// Single status label from user1's perspective.
    pub status: &'static str,
}

/// Orchestrates the repository, the graph mirror, rate limits and events.
pub struct FollowService {
    repository: Arc<FollowRepository>,
    graph: Arc<SocialGraph>,
    follow_limiter: KeyedRateLimiter,
    unfollow_limiter: KeyedRateLimiter,
    block_limiter: KeyedRateLimiter,
    events: Option<Arc<dyn RelationshipEventSink>>,
}

impl FollowService {
    /// Service with the standard per-minute rate limits.
    #[must_use]
    pub fn new(repository: Arc<FollowRepository>, graph: Arc<SocialGraph>) -> Self {
        Self {
            repository,
            graph,
            follow_limiter: KeyedRateLimiter::new(RateLimitConfig::follows()),
            unfollow_limiter: KeyedRateLimiter::new(RateLimitConfig::unfollows()),
            block_limiter: KeyedRateLimiter::new(RateLimitConfig::blocks()),
            events: None,
        }
    }

    /// Service with custom limiters (tests inject deterministic clocks
    /// through these).
    #[must_use]
    pub fn with_limiters(
        repository: Arc<FollowRepository>,
        graph: Arc<SocialGraph>,
        follow_limiter: KeyedRateLimiter,
        unfollow_limiter: KeyedRateLimiter,
        block_limiter: KeyedRateLimiter,
    ) -> Self {
        Self {
            repository,
            graph,
            follow_limiter,
            unfollow_limiter,
            block_limiter,
            events: None,
        }
    }

    /// Register the relationship-event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn RelationshipEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Shared graph handle (recommendation readers go straight to it).
    #[must_use]
    pub fn graph(&self) -> Arc<SocialGraph> {
        Arc::clone(&self.graph)
    }

    /// Map an operation outcome to the transport envelope.
    pub fn envelope<T: Serialize>(result: &Result<T, MurmurError>, ok_message: &str) -> ResponseEnvelope {
        match result {
            Ok(data) => match serde_json::to_value(data) {
                Ok(value) => ResponseEnvelope::ok(value, ok_message),
                Err(e) => ResponseEnvelope::error("internal_error", e.to_string()),
            },
            Err(e) => ResponseEnvelope::from(e),
        }
    }

    // ── Core mutations ──────────────────────────────────────────────────

    /// Follow a user: validate, rate-limit, check blocks, write through
    /// the repository and mirror into the graph.
    pub async fn follow_user(
        &self,
        follower: &str,
        following: &str,
        follow_type: FollowType,
        source: &str,
    ) -> Result<Follow, MurmurError> {
        validate_distinct(follower, following)?;
        self.check_limit(&self.follow_limiter, follower, "follow")?;

        let relationship = self.repository.get_relationship(follower, following).await?;
        if relationship.user2_blocked_user1 {
            return Err(FollowError::Forbidden {
                reason: "actor is blocked by target".to_string(),
            }
            .into());
        }
        if relationship.user1_blocked_user2 {
            return Err(FollowError::Forbidden {
                reason: "actor has blocked target".to_string(),
            }
            .into());
        }

        // Graph first; rolled back if the durable write fails.
        let mirrored = self.graph.add_follow(follower, following);
        match self
            .repository
            .create_follow(follower, following, follow_type, source)
            .await
        {
            Ok(follow) => {
                self.emit(follower, following, RelationshipEventKind::Follow);
                info!(follower, following, "follow created");
                Ok(follow)
            },
            Err(e) => {
                if mirrored {
                    self.graph.remove_follow(follower, following);
                }
                Err(e)
            },
        }
    }

    /// Unfollow a user. Returns `false` when there was nothing to remove.
    pub async fn unfollow_user(&self, follower: &str, following: &str) -> Result<bool, MurmurError> {
        validate_distinct(follower, following)?;
        self.check_limit(&self.unfollow_limiter, follower, "unfollow")?;

        let mirrored = self.graph.remove_follow(follower, following);
        match self.repository.remove_follow(follower, following).await {
            Ok(removed) => {
                if removed {
                    self.emit(follower, following, RelationshipEventKind::Unfollow);
                }
                Ok(removed)
            },
            Err(e) => {
                if mirrored {
                    self.graph.add_follow(follower, following);
                }
                Err(e)
            },
        }
    }

    /// Block a user. Both directed follows disappear (graph and storage)
    /// before the block is recorded, so no reader observes "blocked and
    /// following" together.
    pub async fn block_user(&self, blocker: &str, blocked: &str) -> Result<bool, MurmurError> {
        validate_distinct(blocker, blocked)?;
        self.check_limit(&self.block_limiter, blocker, "block")?;

        let had_forward = self.graph.remove_follow(blocker, blocked);
        let had_backward = self.graph.remove_follow(blocked, blocker);

        match self.repository.block_user(blocker, blocked).await {
            Ok(recorded) => {
                self.emit(blocker, blocked, RelationshipEventKind::Block);
                info!(blocker, blocked, "user blocked");
                Ok(recorded)
            },
            Err(e) => {
                if had_forward {
                    self.graph.add_follow(blocker, blocked);
                }
                if had_backward {
                    self.graph.add_follow(blocked, blocker);
                }
                Err(e)
            },
        }
    }

    /// Remove a block. Previously removed follows stay removed.
    pub async fn unblock_user(&self, blocker: &str, blocked: &str) -> Result<bool, MurmurError> {
        validate_distinct(blocker, blocked)?;
        let removed = self.repository.unblock_user(blocker, blocked).await?;
        if removed {
            self.emit(blocker, blocked, RelationshipEventKind::Unblock);
        }
        Ok(removed)
    }

    /// Mute a user.
    pub async fn mute_user(&self, muter: &str, muted: &str) -> Result<bool, MurmurError> {
        validate_distinct(muter, muted)?;
        let recorded = self.repository.mute_user(muter, muted).await?;
        if recorded {
            self.emit(muter, muted, RelationshipEventKind::Mute);
        }
        Ok(recorded)
    }

    /// Remove a mute.
    pub async fn unmute_user(&self, muter: &str, muted: &str) -> Result<bool, MurmurError> {
        validate_distinct(muter, muted)?;
        let removed = self.repository.unmute_user(muter, muted).await?;
        if removed {
            self.emit(muter, muted, RelationshipEventKind::Unmute);
        }
        Ok(removed)
    }

    // ── Relationship queries ────────────────────────────────────────────

    /// Projection plus status label.
    pub async fn get_relationship(&self, user1: &str, user2: &str) -> Result<RelationshipView, MurmurError> {
        let relationship = self.repository.get_relationship(user1, user2).await?;
        let status = relationship.status_label();
        Ok(RelationshipView {
            relationship,
            status,
        })
    }

    /// Whether the two users follow each other.
    pub async fn are_mutual_friends(&self, user1: &str, user2: &str) -> Result<bool, MurmurError> {
        Ok(self.repository.get_relationship(user1, user2).await?.are_mutual_friends())
    }

    /// Whether `follower` follows `following`.
    pub async fn is_following(&self, follower: &str, following: &str) -> Result<bool, MurmurError> {
        self.repository.is_following(follower, following).await
    }

    /// Relationship status for many targets in one pass.
    pub async fn get_bulk_relationships(
        &self,
        user: &str,
        targets: &[String],
    ) -> Result<std::collections::HashMap<String, bool>, MurmurError> {
        if targets.len() > MAX_BULK_OPERATIONS {
            return Err(FollowError::BulkLimitExceeded {
                requested: targets.len(),
                max: MAX_BULK_OPERATIONS,
            }
            .into());
        }
        self.repository.bulk_is_following(user, targets).await
    }

    // ── Lists ───────────────────────────────────────────────────────────

    /// Followers of `user` with privacy rules applied.
    pub async fn get_followers(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
        requester: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.repository
            .get_followers(user, limit.clamp(1, MAX_LIST_LIMIT), cursor, requester)
            .await
    }

    /// Followees of `user` with privacy rules applied.
    pub async fn get_following(
        &self,
        user: &str,
        limit: usize,
        cursor: Option<&str>,
        requester: Option<&str>,
    ) -> Result<FollowPage, MurmurError> {
        self.repository
            .get_following(user, limit.clamp(1, MAX_LIST_LIMIT), cursor, requester)
            .await
    }

    /// Users both follow, from the graph mirror.
    pub async fn get_mutual_friends(
        &self,
        user1: &str,
        user2: &str,
        limit: usize,
    ) -> Result<Vec<String>, MurmurError> {
        Ok(self.graph.mutual_friends(user1, user2, Some(limit.clamp(1, MAX_LIST_LIMIT))))
    }

    // ── Recommendations ─────────────────────────────────────────────────

    /// Friend recommendations via the graph engine.
    pub async fn get_friend_recommendations(
        &self,
        user: &str,
        limit: usize,
        algorithm: &str,
    ) -> Result<Vec<Recommendation>, MurmurError> {
        let algorithm: RecommendationAlgorithm = algorithm.parse().map_err(MurmurError::from)?;
        let limit = limit.clamp(1, MAX_RECOMMENDATIONS);
        Ok(self.graph.recommendations(user, algorithm, limit).await)
    }

    // ── Bulk operations ─────────────────────────────────────────────────

    /// Follow up to [`MAX_BULK_OPERATIONS`] targets at once.
    pub async fn bulk_follow(
        &self,
        follower: &str,
        targets: &[String],
        follow_type: FollowType,
        source: &str,
    ) -> Result<BulkResult, MurmurError> {
        if targets.len() > MAX_BULK_OPERATIONS {
            return Err(FollowError::BulkLimitExceeded {
                requested: targets.len(),
                max: MAX_BULK_OPERATIONS,
            }
            .into());
        }
        self.check_limit(&self.follow_limiter, follower, "follow")?;

        let result = self
            .repository
            .bulk_follow(follower, targets, follow_type, source)
            .await?;

        for entry in result.results.iter().filter(|e| e.success) {
            self.graph.add_follow(follower, &entry.target_id);
            self.emit(follower, &entry.target_id, RelationshipEventKind::Follow);
        }
        debug!(
            follower,
            successful = result.successful,
            failed = result.failed,
            "bulk follow applied"
        );
        Ok(result)
    }

    /// Unfollow up to [`MAX_BULK_OPERATIONS`] targets at once.
    pub async fn bulk_unfollow(&self, follower: &str, targets: &[String]) -> Result<BulkResult, MurmurError> {
        if targets.len() > MAX_BULK_OPERATIONS {
            return Err(FollowError::BulkLimitExceeded {
                requested: targets.len(),
                max: MAX_BULK_OPERATIONS,
            }
            .into());
        }
        self.check_limit(&self.unfollow_limiter, follower, "unfollow")?;

        let result = self.repository.bulk_unfollow(follower, targets).await?;
        for entry in result.results.iter().filter(|e| e.success) {
            self.graph.remove_follow(follower, &entry.target_id);
            self.emit(follower, &entry.target_id, RelationshipEventKind::Unfollow);
        }
        Ok(result)
    }

    // ── Metrics & analytics ─────────────────────────────────────────────

    /// Read-through social counters.
    pub async fn get_social_metrics(&self, user: &str) -> Result<SocialMetrics, MurmurError> {
        self.repository.get_social_metrics(user).await
    }

    /// Follower analytics; subjects may only read their own.
    pub async fn get_follower_analytics(
        &self,
        user: &str,
        requester: &str,
        days: u32,
    ) -> Result<FollowerAnalytics, MurmurError> {
        if requester != user {
            return Err(FollowError::Forbidden {
                reason: "analytics are only visible to the subject".to_string(),
            }
            .into());
        }
        self.repository.get_follower_analytics(user, days).await
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn check_limit(&self, limiter: &KeyedRateLimiter, actor: &str, action: &str) -> Result<(), MurmurError> {
        limiter.try_acquire(actor).map_err(|retry_after| {
            warn!(actor, action, retry_after, "rate limit exceeded");
            FollowError::RateLimited {
                action: action.to_string(),
                retry_after: Some(retry_after),
            }
            .into()
        })
    }

    fn emit(&self, actor: &str, target: &str, kind: RelationshipEventKind) {
        if let Some(sink) = &self.events {
            sink.relationship_event(&RelationshipEvent {
                actor: actor.to_string(),
                target: target.to_string(),
                kind,
                occurred_at: now_millis(),
            });
        }
    }
}

impl std::fmt::Debug for FollowService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowService").finish_non_exhaustive()
    }
}

fn validate_distinct(actor: &str, target: &str) -> Result<(), FollowError> {
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
