//! End-to-end service scenarios over the in-memory backend.
//!
//! Every test drives the full stack: service → repository → cached
//! executor → load balancer → connection pool → storage driver.

use std::sync::Arc;

use murmur_db::config::{CacheConfig, PoolConfig};
use murmur_db::conninfo::ConnectionInfo;
use murmur_db::driver::MemoryDriver;
use murmur_db::executor::CachedExecutor;
use murmur_db::monitor::PerformanceMonitor;
use murmur_db::pool::ConnectionPool;
use murmur_db::QueryCache;
use murmur_error::MurmurError;
use murmur_follow::rate_limit::{KeyedRateLimiter, RateLimitConfig};
use murmur_follow::service::MAX_BULK_OPERATIONS;
use murmur_follow::{
    FollowRepository, FollowService, FollowType, RelationshipEvent, RelationshipEventKind,
    RelationshipEventSink,
};
use murmur_graph::SocialGraph;
use parking_lot::Mutex;

struct CollectingSink {
    events: Mutex<Vec<(String, String, RelationshipEventKind)>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }
}

impl RelationshipEventSink for CollectingSink {
    fn relationship_event(&self, event: &RelationshipEvent) {
        self.events
            .lock()
            .push((event.actor.clone(), event.target.clone(), event.kind));
    }
}

async fn build_service() -> FollowService {
    build_service_with_limits(
        RateLimitConfig::unlimited(),
        RateLimitConfig::unlimited(),
        RateLimitConfig::unlimited(),
    )
    .await
}

async fn build_service_with_limits(
    follow: RateLimitConfig,
    unfollow: RateLimitConfig,
    block: RateLimitConfig,
) -> FollowService {
    let driver = Arc::new(MemoryDriver::new());
    let monitor = Arc::new(PerformanceMonitor::with_defaults());
    let pool = ConnectionPool::connect(
        driver,
        ConnectionInfo::parse("memory://local/social").expect("conninfo parses"),
        PoolConfig {
            min_connections: 1,
            max_connections: 4,
            connection_timeout_secs: 2,
            ..PoolConfig::default()
        },
        Arc::clone(&monitor),
    )
    .await
    .expect("pool builds");

    let cache = Arc::new(QueryCache::new(CacheConfig::default()));
    let executor = Arc::new(CachedExecutor::single(cache, Arc::new(pool), monitor));
    let repository = Arc::new(FollowRepository::new(executor));
    let graph = Arc::new(SocialGraph::with_defaults());

    FollowService::with_limiters(
        repository,
        graph,
        KeyedRateLimiter::new(follow),
        KeyedRateLimiter::new(unfollow),
        KeyedRateLimiter::new(block),
    )
}

// ============================================================================
// S1 — basic follow/unfollow
// ============================================================================

#[tokio::test]
async fn s1_basic_follow_unfollow() {
    let service = build_service().await;

    let follow = service
        .follow_user("u_1", "u_2", FollowType::Standard, "api")
        .await
        .expect("follow succeeds");
    assert!(follow.active);
    assert_eq!(follow.follower_id, "u_1");
    assert_eq!(follow.following_id, "u_2");

    assert!(service.is_following("u_1", "u_2").await.expect("query works"));
    let m2 = service.get_social_metrics("u_2").await.expect("metrics");
    let m1 = service.get_social_metrics("u_1").await.expect("metrics");
    assert_eq!(m2.followers, 1);
    assert_eq!(m1.following, 1);

    // Graph mirror agrees.
    assert_eq!(service.graph().user_metrics("u_2").follower_count, 1);
    assert_eq!(service.graph().user_metrics("u_1").following_count, 1);

    let removed = service.unfollow_user("u_1", "u_2").await.expect("unfollow succeeds");
    assert!(removed);
    assert!(!service.is_following("u_1", "u_2").await.expect("query works"));

    let m2 = service.get_social_metrics("u_2").await.expect("metrics");
    let m1 = service.get_social_metrics("u_1").await.expect("metrics");
    assert_eq!(m2.followers, 0);
    assert_eq!(m1.following, 0);
    assert_eq!(service.graph().user_metrics("u_2").follower_count, 0);
}

#[tokio::test]
async fn s1_refollow_is_idempotent() {
    let service = build_service().await;
    service
        .follow_user("u_1", "u_2", FollowType::Standard, "api")
        .await
        .expect("first follow");
    let second = service
        .follow_user("u_1", "u_2", FollowType::Standard, "api")
        .await
        .expect("second follow is an upsert");
    assert!(second.active);

    // One active edge, counted once.
    assert_eq!(service.get_social_metrics("u_2").await.expect("metrics").followers, 1);
}

#[tokio::test]
async fn s1_unfollow_without_follow_reports_false() {
    let service = build_service().await;
    let removed = service.unfollow_user("u_1", "u_2").await.expect("no error");
    assert!(!removed);
}

// ============================================================================
// S2 — mutual friends
// ============================================================================

#[tokio::test]
async fn s2_mutual_friends() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");
    service.follow_user("u_2", "u_1", FollowType::Standard, "api").await.expect("follow");
    service.follow_user("u_1", "u_3", FollowType::Standard, "api").await.expect("follow");
    service.follow_user("u_2", "u_3", FollowType::Standard, "api").await.expect("follow");

    assert!(service.are_mutual_friends("u_1", "u_2").await.expect("query"));
    assert!(!service.are_mutual_friends("u_1", "u_3").await.expect("query"));

    let view = service.get_relationship("u_1", "u_2").await.expect("relationship");
    assert_eq!(view.status, "mutual");

    // u_1 and u_2 both follow u_3.
    let shared = service.get_mutual_friends("u_1", "u_2", 10).await.expect("query");
    assert_eq!(shared, vec!["u_3"]);
}

// ============================================================================
// S3 — block removes follows
// ============================================================================

#[tokio::test]
async fn s3_block_removes_both_follows() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");
    service.follow_user("u_2", "u_1", FollowType::Standard, "api").await.expect("follow");

    service.block_user("u_1", "u_2").await.expect("block succeeds");

    assert!(!service.is_following("u_1", "u_2").await.expect("query"));
    assert!(!service.is_following("u_2", "u_1").await.expect("query"));
    assert!(!service.graph().has_follow("u_1", "u_2"));
    assert!(!service.graph().has_follow("u_2", "u_1"));

    let view = service.get_relationship("u_1", "u_2").await.expect("relationship");
    assert!(view.relationship.user1_blocked_user2);
    assert_eq!(view.status, "blocked");
}

#[tokio::test]
async fn s3_blocked_actor_cannot_follow() {
    let service = build_service().await;
    service.block_user("u_2", "u_1").await.expect("block succeeds");

    let err = service
        .follow_user("u_1", "u_2", FollowType::Standard, "api")
        .await
        .expect_err("blocked actor is rejected");
    assert_eq!(err.error_code(), "forbidden");
    assert!(!service.graph().has_follow("u_1", "u_2"), "graph rollback leaves no edge");
}

#[tokio::test]
async fn s3_unblock_does_not_restore_follows() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");
    service.block_user("u_1", "u_2").await.expect("block");
    let removed = service.unblock_user("u_1", "u_2").await.expect("unblock");
    assert!(removed);

    assert!(!service.is_following("u_1", "u_2").await.expect("query"));
    let view = service.get_relationship("u_1", "u_2").await.expect("relationship");
    assert_eq!(view.status, "none");
}

// ============================================================================
// S5 — bulk follow reporting
// ============================================================================

#[tokio::test]
async fn s5_bulk_follow_reports_upserts_as_success() {
    let service = build_service().await;
    // u_3 is already followed; the bulk upsert reactivates/updates it.
    service.follow_user("u_1", "u_3", FollowType::Standard, "api").await.expect("follow");

    let targets = vec!["u_2".to_string(), "u_3".to_string(), "u_4".to_string()];
    let result = service
        .bulk_follow("u_1", &targets, FollowType::Standard, "api")
        .await
        .expect("bulk follow succeeds");

    assert_eq!(result.total, 3);
    assert_eq!(result.successful, 3);
    assert_eq!(result.failed, 0);
    let order: Vec<&str> = result.results.iter().map(|r| r.target_id.as_str()).collect();
    assert_eq!(order, vec!["u_2", "u_3", "u_4"], "input order preserved");

    for target in &targets {
        assert!(service.is_following("u_1", target).await.expect("query"));
        assert!(service.graph().has_follow("u_1", target));
    }
    assert_eq!(service.get_social_metrics("u_1").await.expect("metrics").following, 3);
}

#[tokio::test]
async fn s5_bulk_follow_isolates_invalid_targets() {
    let service = build_service().await;
    let targets = vec!["u_2".to_string(), "u_1".to_string(), "!!".to_string(), "u_4".to_string()];
    let result = service
        .bulk_follow("u_1", &targets, FollowType::Standard, "api")
        .await
        .expect("bulk follow succeeds");

    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 2);
    assert!(result.results[0].success);
    assert!(!result.results[1].success, "self-follow rejected");
    assert!(!result.results[2].success, "malformed id rejected");
    assert!(result.results[3].success);
}

#[tokio::test]
async fn bulk_operations_reject_oversized_batches() {
    let service = build_service().await;
    let targets: Vec<String> = (0..=MAX_BULK_OPERATIONS).map(|i| format!("user_{i}")).collect();
    let err = service
        .bulk_follow("u_1", &targets, FollowType::Standard, "api")
        .await
        .expect_err("oversized batch rejected");
    assert_eq!(err.error_code(), "invalid_input");
}

#[tokio::test]
async fn bulk_unfollow_reports_missing_edges() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");

    let targets = vec!["u_2".to_string(), "u_9".to_string()];
    let result = service.bulk_unfollow("u_1", &targets).await.expect("bulk unfollow");
    assert_eq!(result.successful, 1);
    assert_eq!(result.failed, 1);
    assert!(result.results[0].success);
    assert!(!result.results[1].success);
}

// ============================================================================
// S6 — recommendation sanity
// ============================================================================

#[tokio::test]
async fn s6_mutual_recommendations_rank_shared_paths() {
    let service = build_service().await;
    for (f, t) in [
        ("u_1", "u_2"),
        ("u_1", "u_3"),
        ("u_2", "u_4"),
        ("u_2", "u_5"),
        ("u_3", "u_4"),
        ("u_3", "u_6"),
    ] {
        service.follow_user(f, t, FollowType::Standard, "api").await.expect("follow");
    }

    let recs = service
        .get_friend_recommendations("u_1", 10, "mutual")
        .await
        .expect("recommendations");

    assert_eq!(recs[0].candidate_id, "u_4", "two mutual paths rank first");
    let ids: Vec<&str> = recs.iter().map(|r| r.candidate_id.as_str()).collect();
    assert!(ids.contains(&"u_5"));
    assert!(ids.contains(&"u_6"));
    assert!(!ids.contains(&"u_2"));
    assert!(!ids.contains(&"u_3"));
}

#[tokio::test]
async fn unknown_recommendation_algorithm_is_rejected() {
    let service = build_service().await;
    let err = service
        .get_friend_recommendations("u_1", 10, "pagerank")
        .await
        .expect_err("unknown algorithm");
    assert_eq!(err.error_code(), "graph_unknown_algorithm");
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn follow_rate_limit_applies_per_actor() {
    let tight = RateLimitConfig {
        enabled: true,
        max_requests: 2,
        window_secs: 3600,
    };
    let service = build_service_with_limits(
        tight,
        RateLimitConfig::unlimited(),
        RateLimitConfig::unlimited(),
    )
    .await;

    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("first");
    service.follow_user("u_1", "u_3", FollowType::Standard, "api").await.expect("second");
    let err = service
        .follow_user("u_1", "u_4", FollowType::Standard, "api")
        .await
        .expect_err("third is limited");
    assert_eq!(err.error_code(), "rate_limited");

    // A different actor still has budget.
    service.follow_user("u_9", "u_2", FollowType::Standard, "api").await.expect("other actor");
}

// ============================================================================
// Lists & privacy
// ============================================================================

#[tokio::test]
async fn follower_lists_paginate_by_cursor() {
    let service = build_service().await;
    for i in 0..5 {
        service
            .follow_user(&format!("fan_{i}"), "star", FollowType::Standard, "api")
            .await
            .expect("follow");
        // Distinct millisecond timestamps keep the cursor strict.
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }

    let first = service
        .get_followers("star", 2, None, Some("star"))
        .await
        .expect("first page");
    assert_eq!(first.count, 5);
    assert_eq!(first.entries.len(), 2);
    assert!(first.has_more);
    let cursor = first.next_cursor.clone().expect("cursor present");

    let second = service
        .get_followers("star", 2, Some(&cursor), Some("star"))
        .await
        .expect("second page");
    assert_eq!(second.entries.len(), 2);
    assert!(second.has_more);

    // No overlap between pages.
    let first_ids: Vec<_> = first.entries.iter().map(|e| e.user_id.clone()).collect();
    for entry in &second.entries {
        assert!(!first_ids.contains(&entry.user_id));
    }

    let cursor = second.next_cursor.expect("cursor present");
    let third = service
        .get_followers("star", 2, Some(&cursor), Some("star"))
        .await
        .expect("third page");
    assert_eq!(third.entries.len(), 1);
    assert!(!third.has_more);
    assert!(third.next_cursor.is_none());
}

#[tokio::test]
async fn analytics_are_private_to_the_subject() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");

    let err = service
        .get_follower_analytics("u_2", "u_1", 30)
        .await
        .expect_err("others cannot read analytics");
    assert_eq!(err.error_code(), "forbidden");

    let analytics = service
        .get_follower_analytics("u_2", "u_2", 30)
        .await
        .expect("subject reads analytics");
    assert_eq!(analytics.total_followers, 1);
    assert_eq!(analytics.gained_in_period, 1);
    assert_eq!(analytics.sources.get("api"), Some(&1));
}

// ============================================================================
// Mutes
// ============================================================================

#[tokio::test]
async fn mute_sets_status_without_removing_follow() {
    let service = build_service().await;
    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");
    service.mute_user("u_1", "u_2").await.expect("mute");

    assert!(service.is_following("u_1", "u_2").await.expect("query"), "mute keeps the edge");
    let view = service.get_relationship("u_1", "u_2").await.expect("relationship");
    assert!(view.relationship.user1_muted_user2);
    assert_eq!(view.status, "following", "follow outranks mute in the label");

    service.unmute_user("u_1", "u_2").await.expect("unmute");
    let view = service.get_relationship("u_1", "u_2").await.expect("relationship");
    assert!(!view.relationship.user1_muted_user2);
}

// ============================================================================
// Events & envelopes
// ============================================================================

#[tokio::test]
async fn successful_mutations_emit_one_event_each() {
    let sink = CollectingSink::new();
    let service = build_service().await.with_event_sink(sink.clone());

    service.follow_user("u_1", "u_2", FollowType::Standard, "api").await.expect("follow");
    service.unfollow_user("u_1", "u_2").await.expect("unfollow");
    service.block_user("u_1", "u_2").await.expect("block");
    service.unblock_user("u_1", "u_2").await.expect("unblock");

    let events = sink.events.lock();
    let kinds: Vec<RelationshipEventKind> = events.iter().map(|(_, _, k)| *k).collect();
    assert_eq!(
        kinds,
        vec![
            RelationshipEventKind::Follow,
            RelationshipEventKind::Unfollow,
            RelationshipEventKind::Block,
            RelationshipEventKind::Unblock,
        ]
    );
    assert!(events.iter().all(|(actor, target, _)| actor == "u_1" && target == "u_2"));
}

#[tokio::test]
async fn failed_mutations_emit_no_events() {
    let sink = CollectingSink::new();
    let service = build_service().await.with_event_sink(sink.clone());

    let _ = service.follow_user("u_1", "u_1", FollowType::Standard, "api").await;
    assert!(sink.events.lock().is_empty());
}

#[tokio::test]
async fn envelopes_map_results_and_errors() {
    let service = build_service().await;

    let ok = service.follow_user("u_1", "u_2", FollowType::Standard, "api").await;
    let envelope = FollowService::envelope(&ok, "followed");
    assert!(envelope.success);
    assert!(envelope.error_code.is_none());
    assert!(envelope.data.is_some());

    let err: Result<bool, MurmurError> = service.follow_user("u_1", "u_1", FollowType::Standard, "api")
        .await
        .map(|_| true);
    let envelope = FollowService::envelope(&err, "followed");
    assert!(!envelope.success);
    assert_eq!(envelope.error_code.as_deref(), Some("invalid_input"));
}

// ============================================================================
// Invariant 2: counters equal adjacency sizes after arbitrary churn
// ============================================================================

#[tokio::test]
async fn counters_track_adjacency_through_churn() {
    let service = build_service().await;
    let ops: Vec<(&str, &str, bool)> = vec![
        ("u_1", "u_2", true),
        ("u_1", "u_3", true),
        ("u_2", "u_3", true),
        ("u_1", "u_2", false),
        ("u_3", "u_1", true),
        ("u_1", "u_2", true),
        ("u_2", "u_3", false),
    ];
    for (f, t, add) in ops {
        if add {
            service.follow_user(f, t, FollowType::Standard, "api").await.expect("follow");
        } else {
            service.unfollow_user(f, t).await.expect("unfollow");
        }
    }

    for user in ["u_1", "u_2", "u_3"] {
        let metrics = service.get_social_metrics(user).await.expect("metrics");
        let graph_metrics = service.graph().user_metrics(user);
        assert_eq!(metrics.followers, graph_metrics.follower_count, "{user} followers");
        assert_eq!(metrics.following, graph_metrics.following_count, "{user} following");
    }
    assert!(service.graph().validate_consistency());
}
