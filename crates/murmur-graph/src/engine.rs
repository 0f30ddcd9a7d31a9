//! The social graph engine (C7).
//!
//! State is a pair of adjacency indexes (`out`: who a user follows, `in`:
//! who follows them), per-user counters, and the recommendation cache, all
//! behind a single readers-writer lock. Reads (`has_follow`, list lookups,
//! cache reads) take shared access; writes (edge changes, cache inserts,
//! metric updates) take exclusive access. Nothing holds the lock across an
//! await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use murmur_error::MurmurError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::GraphConfig;
use crate::interests;

/// Default hop bound for path search.
pub const DEFAULT_MAX_HOPS: usize = 6;

/// Concurrent recommendation computations allowed per engine.
const MAX_RECOMMENDATION_WORKERS: usize = 8;

/// Per-user counters maintained alongside the adjacency indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetrics {
    /// Size of the user's `in` set.
    pub follower_count: u64,
    /// Size of the user's `out` set.
    pub following_count: u64,
    /// When the user last gained a follower.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_followed_at: Option<DateTime<Utc>>,
}

/// One scored recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Suggested user to follow.
    pub candidate_id: String,
    /// Algorithm score; higher is better.
    pub score: f64,
    /// Short human-readable justification.
    pub reason: String,
}

/// Engine-wide counters and shape statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetrics {
    /// Users present in the graph.
    pub user_count: usize,
    /// Directed edges present in the graph.
    pub edge_count: usize,
    /// Edge count over the possible `n(n-1)` directed pairs.
    pub density: f64,
    /// Recommendation-cache entries currently stored.
    pub recommendation_cache_size: usize,
    /// Recommendation-cache hits.
    pub cache_hits: u64,
    /// Recommendation-cache misses.
    pub cache_misses: u64,
}

pub(crate) struct RecCacheEntry {
    pub(crate) recommendations: Arc<Vec<Recommendation>>,
    pub(crate) computed_at: Instant,
}

#[derive(Default)]
pub(crate) struct GraphState {
    pub(crate) out: HashMap<String, HashSet<String>>,
    pub(crate) incoming: HashMap<String, HashSet<String>>,
    pub(crate) metrics: HashMap<String, UserMetrics>,
    pub(crate) rec_cache: HashMap<String, RecCacheEntry>,
}

impl GraphState {
    pub(crate) fn follower_count(&self, user: &str) -> u64 {
        self.metrics.get(user).map_or(0, |m| m.follower_count)
    }

    /// Every user id the graph knows about.
    pub(crate) fn known_users(&self) -> HashSet<&String> {
        self.out.keys().chain(self.incoming.keys()).collect()
    }
}

/// In-memory bidirectional follow graph with recommendation caches.
pub struct SocialGraph {
    pub(crate) state: RwLock<GraphState>,
    pub(crate) config: GraphConfig,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
}

impl SocialGraph {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns [`MurmurError::Config`] when the configuration is invalid.
    pub fn new(config: GraphConfig) -> Result<Self, MurmurError> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(GraphState::default()),
            config,
            workers: Arc::new(Semaphore::new(MAX_RECOMMENDATION_WORKERS)),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Engine with default configuration.
    ///
    /// # Panics
    ///
    /// Never panics; the default configuration is valid.
    #[must_use]
    pub fn with_defaults() -> Self {
        #[allow(clippy::expect_used)]
        Self::new(GraphConfig::default()).expect("default graph config is valid")
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ── Edge operations ─────────────────────────────────────────────────

    /// Insert the edge `follower → following`.
    ///
    /// Returns `true` when the edge was new. Self-follows and malformed
    /// ids return `false` without touching the graph.
    pub fn add_follow(&self, follower: &str, following: &str) -> bool {
        if follower == following || !is_valid_user_id(follower) || !is_valid_user_id(following) {
            return false;
        }

        let mut state = self.state.write();
        let inserted = state
            .out
            .entry(follower.to_string())
            .or_default()
            .insert(following.to_string());
        if !inserted {
            return false;
        }
        state
            .incoming
            .entry(following.to_string())
            .or_default()
            .insert(follower.to_string());

        state.metrics.entry(follower.to_string()).or_default().following_count += 1;
        let target = state.metrics.entry(following.to_string()).or_default();
        target.follower_count += 1;
        target.last_followed_at = Some(Utc::now());

        Self::invalidate_rec_cache(&mut state, follower);
        Self::invalidate_rec_cache(&mut state, following);
        true
    }

    /// Remove the edge `follower → following`.
    ///
    /// Returns `true` when the edge existed. Counters clamp at zero.
    pub fn remove_follow(&self, follower: &str, following: &str) -> bool {
        let mut state = self.state.write();
        let removed = state
            .out
            .get_mut(follower)
            .is_some_and(|set| set.remove(following));
        if !removed {
            return false;
        }
        if let Some(set) = state.incoming.get_mut(following) {
            set.remove(follower);
        }

        if let Some(m) = state.metrics.get_mut(follower) {
            m.following_count = m.following_count.saturating_sub(1);
        }
        if let Some(m) = state.metrics.get_mut(following) {
            m.follower_count = m.follower_count.saturating_sub(1);
        }

        Self::invalidate_rec_cache(&mut state, follower);
        Self::invalidate_rec_cache(&mut state, following);
        true
    }

    /// O(1) membership check.
    #[must_use]
    pub fn has_follow(&self, follower: &str, following: &str) -> bool {
        self.state
            .read()
            .out
            .get(follower)
            .is_some_and(|set| set.contains(following))
    }

    /// Whether the two users follow each other.
    #[must_use]
    pub fn are_mutual(&self, a: &str, b: &str) -> bool {
        let state = self.state.read();
        state.out.get(a).is_some_and(|s| s.contains(b))
            && state.out.get(b).is_some_and(|s| s.contains(a))
    }

    /// Followers of `user`, unordered, capped at `limit` (`None` = all).
    #[must_use]
    pub fn followers_of(&self, user: &str, limit: Option<usize>) -> Vec<String> {
        let state = self.state.read();
        collect_limited(state.incoming.get(user), limit)
    }

    /// Users `user` follows, unordered, capped at `limit` (`None` = all).
    #[must_use]
    pub fn following_of(&self, user: &str, limit: Option<usize>) -> Vec<String> {
        let state = self.state.read();
        collect_limited(state.out.get(user), limit)
    }

    /// Users both `a` and `b` follow.
    #[must_use]
    pub fn mutual_friends(&self, a: &str, b: &str, limit: Option<usize>) -> Vec<String> {
        let state = self.state.read();
        let (Some(fa), Some(fb)) = (state.out.get(a), state.out.get(b)) else {
            return Vec::new();
        };
        let mut shared: Vec<String> = fa.intersection(fb).cloned().collect();
        shared.sort();
        if let Some(limit) = limit {
            shared.truncate(limit);
        }
        shared
    }

    /// Relationship check for many targets in one lock acquisition.
    #[must_use]
    pub fn bulk_check(&self, user: &str, targets: &[String]) -> HashMap<String, bool> {
        let state = self.state.read();
        let following = state.out.get(user);
        targets
            .iter()
            .map(|t| (t.clone(), following.is_some_and(|set| set.contains(t))))
            .collect()
    }

    /// Per-user counters; zeroed for unknown users.
    #[must_use]
    pub fn user_metrics(&self, user: &str) -> UserMetrics {
        self.state.read().metrics.get(user).cloned().unwrap_or_default()
    }

    // ── Traversal ───────────────────────────────────────────────────────

    /// Breadth-first shortest path from `from` to `to` over `out` edges,
    /// bounded by `max_hops` (default 6). Returns the full node path, or
    /// empty when unreachable within the bound.
    #[must_use]
    pub fn shortest_path(&self, from: &str, to: &str, max_hops: Option<usize>) -> Vec<String> {
        let max_hops = max_hops.unwrap_or(DEFAULT_MAX_HOPS);
        if from == to {
            return vec![from.to_string()];
        }

        let state = self.state.read();
        let mut parents: HashMap<&str, &str> = HashMap::new();
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(from);
        depth.insert(from, 0);

        while let Some(current) = queue.pop_front() {
            if current == to {
                // First dequeue of the target: BFS guarantees minimality.
                let mut path = vec![to.to_string()];
                let mut cursor = to;
                while let Some(parent) = parents.get(cursor) {
                    path.push((*parent).to_string());
                    cursor = parent;
                }
                path.reverse();
                return path;
            }
            let hops = depth[current];
            if hops >= max_hops {
                continue;
            }
            if let Some(nexts) = state.out.get(current) {
                for next in nexts {
                    if !depth.contains_key(next.as_str()) {
                        depth.insert(next, hops + 1);
                        parents.insert(next, current);
                        queue.push_back(next);
                    }
                }
            }
        }
        Vec::new()
    }

    /// Degrees of separation between two users; `None` when not connected
    /// within `max_hops`.
    #[must_use]
    pub fn degrees_of_separation(&self, from: &str, to: &str, max_hops: Option<usize>) -> Option<usize> {
        let path = self.shortest_path(from, to, max_hops);
        if path.is_empty() {
            None
        } else {
            Some(path.len() - 1)
        }
    }

    // ── Scoring ─────────────────────────────────────────────────────────

    /// Influence score: audience size, follow asymmetry, neighborhood
    /// centrality and engagement, weighted 0.4 / 0.3 / 0.2 / 0.1.
    #[must_use]
    pub fn influence_score(&self, user: &str) -> f64 {
        let state = self.state.read();
        let metrics = state.metrics.get(user).cloned().unwrap_or_default();

        let audience = ((metrics.follower_count + 1) as f64).ln();
        let ratio = metrics.follower_count as f64 / (metrics.following_count.max(1)) as f64;

        let centrality = state.out.get(user).map_or(0.0, |following| {
            if following.is_empty() {
                return 0.0;
            }
            let sum: f64 = following
                .iter()
                .map(|m| ((state.follower_count(m) + 1) as f64).ln())
                .sum();
            sum / following.len() as f64
        });
        // Normalize against the largest audience any single node could
        // have in this graph.
        let user_count = state.known_users().len();
        let normalizer = ((user_count + 1) as f64).ln().max(1.0);
        let normalized_centrality = (centrality / normalizer).min(1.0);

        let engagement = interests::engagement_score(user);

        audience * 0.4 + ratio * 0.3 + normalized_centrality * 0.2 + engagement * 0.1
    }

    // ── Maintenance & observability ─────────────────────────────────────

    /// Engine-wide counters and shape statistics.
    #[must_use]
    pub fn metrics(&self) -> GraphMetrics {
        let state = self.state.read();
        let user_count = state.known_users().len();
        let edge_count: usize = state.out.values().map(HashSet::len).sum();
        let possible = user_count.saturating_mul(user_count.saturating_sub(1));
        GraphMetrics {
            user_count,
            edge_count,
            density: if possible == 0 {
                0.0
            } else {
                edge_count as f64 / possible as f64
            },
            recommendation_cache_size: state.rec_cache.len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Remove all graph data and caches.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.out.clear();
        state.incoming.clear();
        state.metrics.clear();
        state.rec_cache.clear();
        debug!("social graph cleared");
    }

    /// Verify that the adjacency indexes mirror each other and that the
    /// counters match set sizes. Cheap enough for tests and admin probes.
    #[must_use]
    pub fn validate_consistency(&self) -> bool {
        let state = self.state.read();
        for (follower, followed) in &state.out {
            for f in followed {
                if !state.incoming.get(f).is_some_and(|set| set.contains(follower)) {
                    return false;
                }
            }
        }
        for (user, metrics) in &state.metrics {
            let followers = state.incoming.get(user).map_or(0, HashSet::len) as u64;
            let following = state.out.get(user).map_or(0, HashSet::len) as u64;
            if metrics.follower_count != followers || metrics.following_count != following {
                return false;
            }
        }
        true
    }

    /// Drop every cached recommendation for `user`, across algorithms.
    pub(crate) fn invalidate_rec_cache(state: &mut GraphState, user: &str) {
        let suffix = format!(":{user}");
        state.rec_cache.retain(|key, _| !key.ends_with(&suffix));
    }
}

impl std::fmt::Debug for SocialGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.metrics();
        f.debug_struct("SocialGraph")
            .field("users", &metrics.user_count)
            .field("edges", &metrics.edge_count)
            .finish_non_exhaustive()
    }
}

/// Identifier rule: 3–64 chars from `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_valid_user_id(id: &str) -> bool {
    (3..=64).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn collect_limited(set: Option<&HashSet<String>>, limit: Option<usize>) -> Vec<String> {
    match set {
        None => Vec::new(),
        Some(set) => match limit {
            Some(limit) => set.iter().take(limit).cloned().collect(),
            None => set.iter().cloned().collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> SocialGraph {
        SocialGraph::with_defaults()
    }

    // ========================================================================
    // Edge operations and counters
    // ========================================================================

    #[test]
    fn test_add_and_remove_follow() {
        let g = graph();
        assert!(g.add_follow("u_1", "u_2"));
        assert!(g.has_follow("u_1", "u_2"));
        assert!(!g.has_follow("u_2", "u_1"));

        assert!(g.remove_follow("u_1", "u_2"));
        assert!(!g.has_follow("u_1", "u_2"));
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let g = graph();
        assert!(g.add_follow("u_1", "u_2"));
        assert!(!g.add_follow("u_1", "u_2"));
        assert_eq!(g.user_metrics("u_2").follower_count, 1);
    }

    #[test]
    fn test_self_follow_rejected() {
        let g = graph();
        assert!(!g.add_follow("u_1", "u_1"));
        assert!(!g.has_follow("u_1", "u_1"));
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let g = graph();
        assert!(!g.add_follow("ab", "u_2"), "too short");
        assert!(!g.add_follow("user with spaces", "u_2"));
        assert!(!g.add_follow(&"x".repeat(65), "u_2"), "too long");
    }

    #[test]
    fn test_counters_match_set_sizes() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        g.add_follow("u_1", "u_3");
        g.add_follow("u_2", "u_3");

        assert_eq!(g.user_metrics("u_1").following_count, 2);
        assert_eq!(g.user_metrics("u_3").follower_count, 2);
        assert!(g.validate_consistency());

        g.remove_follow("u_1", "u_3");
        assert_eq!(g.user_metrics("u_3").follower_count, 1);
        assert!(g.validate_consistency());
    }

    #[test]
    fn test_remove_missing_edge_clamps() {
        let g = graph();
        assert!(!g.remove_follow("u_1", "u_2"));
        assert_eq!(g.user_metrics("u_1").following_count, 0);
    }

    #[test]
    fn test_last_followed_at_set_on_gain() {
        let g = graph();
        assert!(g.user_metrics("u_2").last_followed_at.is_none());
        g.add_follow("u_1", "u_2");
        assert!(g.user_metrics("u_2").last_followed_at.is_some());
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[test]
    fn test_mutuals() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        assert!(!g.are_mutual("u_1", "u_2"));
        g.add_follow("u_2", "u_1");
        assert!(g.are_mutual("u_1", "u_2"));
    }

    #[test]
    fn test_mutual_friends_intersection() {
        let g = graph();
        g.add_follow("u_1", "u_3");
        g.add_follow("u_1", "u_4");
        g.add_follow("u_2", "u_3");
        g.add_follow("u_2", "u_5");
        assert_eq!(g.mutual_friends("u_1", "u_2", None), vec!["u_3"]);
    }

    #[test]
    fn test_bulk_check() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        let result = g.bulk_check("u_1", &["u_2".to_string(), "u_3".to_string()]);
        assert!(result["u_2"]);
        assert!(!result["u_3"]);
    }

    #[test]
    fn test_list_lookups_respect_limit() {
        let g = graph();
        for i in 0..10 {
            g.add_follow(&format!("f_{i}"), "hub");
        }
        assert_eq!(g.followers_of("hub", Some(3)).len(), 3);
        assert_eq!(g.followers_of("hub", None).len(), 10);
        assert!(g.following_of("hub", None).is_empty());
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    #[test]
    fn test_shortest_path_direct() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        assert_eq!(g.shortest_path("u_1", "u_2", None), vec!["u_1", "u_2"]);
    }

    #[test]
    fn test_shortest_path_prefers_fewest_hops() {
        let g = graph();
        // Long way round and a shortcut.
        g.add_follow("u_1", "u_2");
        g.add_follow("u_2", "u_3");
        g.add_follow("u_3", "u_4");
        g.add_follow("u_1", "u_4");
        assert_eq!(g.shortest_path("u_1", "u_4", None), vec!["u_1", "u_4"]);
        assert_eq!(g.degrees_of_separation("u_1", "u_4", None), Some(1));
    }

    #[test]
    fn test_shortest_path_directionality() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        assert!(g.shortest_path("u_2", "u_1", None).is_empty());
    }

    #[test]
    fn test_shortest_path_hop_bound() {
        let g = graph();
        for i in 0..8 {
            g.add_follow(&format!("n_{i}"), &format!("n_{}", i + 1));
        }
        assert!(g.shortest_path("n_0", "n_8", None).is_empty(), "8 hops > default 6");
        assert_eq!(g.shortest_path("n_0", "n_8", Some(8)).len(), 9);
    }

    #[test]
    fn test_shortest_path_to_self() {
        let g = graph();
        assert_eq!(g.shortest_path("u_1", "u_1", None), vec!["u_1"]);
        assert_eq!(g.degrees_of_separation("u_1", "u_1", None), Some(0));
    }

    // ========================================================================
    // Scoring and metrics
    // ========================================================================

    #[test]
    fn test_influence_grows_with_audience() {
        let g = graph();
        for i in 0..20 {
            g.add_follow(&format!("fan_{i}"), "star");
        }
        g.add_follow("nobody", "star");
        assert!(g.influence_score("star") > g.influence_score("nobody"));
    }

    #[test]
    fn test_graph_metrics() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        g.add_follow("u_2", "u_3");

        let m = g.metrics();
        assert_eq!(m.user_count, 3);
        assert_eq!(m.edge_count, 2);
        assert!(m.density > 0.0 && m.density < 1.0);
    }

    #[test]
    fn test_clear() {
        let g = graph();
        g.add_follow("u_1", "u_2");
        g.clear();
        assert_eq!(g.metrics().user_count, 0);
        assert!(!g.has_follow("u_1", "u_2"));
    }

    #[test]
    fn test_user_id_validation() {
        assert!(is_valid_user_id("abc"));
        assert!(is_valid_user_id("user-42_x"));
        assert!(!is_valid_user_id("ab"));
        assert!(!is_valid_user_id("has space"));
        assert!(!is_valid_user_id("has.dot"));
    }

    // ========================================================================
    // Concurrency (invariant 5: last serialized operation wins)
    // ========================================================================

    #[test]
    fn test_concurrent_add_remove_single_pair() {
        use std::thread;

        let g = Arc::new(graph());
        let mut handles = Vec::new();
        for i in 0..8 {
            let g = Arc::clone(&g);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        g.add_follow("u_a", "u_b");
                    } else {
                        g.remove_follow("u_a", "u_b");
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // Serialize one final operation; state must match it exactly.
        g.add_follow("u_a", "u_b");
        assert!(g.has_follow("u_a", "u_b"));
        assert_eq!(g.user_metrics("u_b").follower_count, 1);
        assert!(g.validate_consistency());
    }
}
