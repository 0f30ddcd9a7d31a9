//! Recommendation pipelines (mutual-friends, interest-based, trending,
//! hybrid) with a per-`(algorithm, user)` cache.
//!
//! Computation runs on tokio workers bounded by the engine's semaphore so
//! request bursts cannot spawn unbounded tasks. A worker that fails or
//! panics yields an empty list and a logged warning; the cache is only
//! written on success, so failures never poison it.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::warn;

use crate::config::RecommendationAlgorithm;
use crate::engine::{RecCacheEntry, Recommendation, SocialGraph};
use crate::interests;

/// Popularity bonus factor in mutual-friend scoring.
const MUTUAL_POPULARITY_FACTOR: f64 = 0.1;
/// Popularity bonus factor in interest scoring.
const INTEREST_POPULARITY_FACTOR: f64 = 0.05;
/// Minimum interest similarity for a candidate to qualify.
const MIN_INTEREST_SIMILARITY: f64 = 0.1;
/// Trending window in hours.
const TRENDING_WINDOW_HOURS: f64 = 168.0;
/// Minimum trending score for a candidate to qualify.
const MIN_TRENDING_SCORE: f64 = 1.0;

impl SocialGraph {
    /// Recommendations for `user` using the given algorithm, best first.
    pub async fn recommendations(
        self: &Arc<Self>,
        user: &str,
        algorithm: RecommendationAlgorithm,
        limit: usize,
    ) -> Vec<Recommendation> {
        self.cached_recommendations(algorithm, user, limit).await
    }

    /// Friends-of-friends recommendations, best first.
    pub async fn mutual_friend_recommendations(self: &Arc<Self>, user: &str, limit: usize) -> Vec<Recommendation> {
        self.cached_recommendations(RecommendationAlgorithm::Mutual, user, limit).await
    }

    /// Interest-similarity recommendations, best first.
    pub async fn interest_recommendations(self: &Arc<Self>, user: &str, limit: usize) -> Vec<Recommendation> {
        self.cached_recommendations(RecommendationAlgorithm::Interests, user, limit).await
    }

    /// Trending-user recommendations, best first.
    pub async fn trending_recommendations(self: &Arc<Self>, user: &str, limit: usize) -> Vec<Recommendation> {
        self.cached_recommendations(RecommendationAlgorithm::Trending, user, limit).await
    }

    async fn cached_recommendations(
        self: &Arc<Self>,
        algorithm: RecommendationAlgorithm,
        user: &str,
        limit: usize,
    ) -> Vec<Recommendation> {
        let limit = limit.min(self.config.max_recommendations);
        let key = format!("{}:{}", algorithm.cache_prefix(), user);
        let ttl = Duration::from_secs(self.config.cache_ttl_seconds);

        {
            let state = self.state.read();
            if let Some(entry) = state.rec_cache.get(&key) {
                if entry.computed_at.elapsed() < ttl {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return entry.recommendations.iter().take(limit).cloned().collect();
                }
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
            // Semaphore closed only on teardown.
            return Vec::new();
        };
        let this = Arc::clone(self);
        let owner = user.to_string();
        let worker = tokio::spawn(async move {
            let _permit = permit;
            this.compute(algorithm, &owner)
        });

        match worker.await {
            Ok(recommendations) => {
                let recommendations = Arc::new(recommendations);
                let mut state = self.state.write();
                state.rec_cache.insert(
                    key,
                    RecCacheEntry {
                        recommendations: Arc::clone(&recommendations),
                        computed_at: Instant::now(),
                    },
                );
                drop(state);
                recommendations.iter().take(limit).cloned().collect()
            },
            Err(e) => {
                warn!(user, algorithm = %algorithm, error = %e, "recommendation worker failed");
                Vec::new()
            },
        }
    }

    fn compute(&self, algorithm: RecommendationAlgorithm, user: &str) -> Vec<Recommendation> {
        let mut recommendations = match algorithm {
            RecommendationAlgorithm::Mutual => self.compute_mutual(user),
            RecommendationAlgorithm::Interests => self.compute_interest(user),
            RecommendationAlgorithm::Trending => self.compute_trending(user),
            RecommendationAlgorithm::Hybrid => self.compute_hybrid(user),
        };
        recommendations.truncate(self.config.max_recommendations);
        recommendations
    }

    /// Mutual-friends scoring: every shared connection adds
    /// `mutual_friend_weight`, plus a log-scaled popularity bonus.
    /// Ties break on follower count, then candidate id.
    fn compute_mutual(&self, user: &str) -> Vec<Recommendation> {
        let state = self.state.read();
        let Some(friends) = state.out.get(user) else {
            return Vec::new();
        };

        let mut scores: HashMap<&str, f64> = HashMap::new();
        let mut via: HashMap<&str, Vec<&str>> = HashMap::new();
        for friend in friends {
            let Some(theirs) = state.out.get(friend) else {
                continue;
            };
            for candidate in theirs {
                if candidate == user || friends.contains(candidate) {
                    continue;
                }
                *scores.entry(candidate).or_default() += self.config.mutual_friend_weight;
                via.entry(candidate).or_default().push(friend);
            }
        }

        let mut ranked: Vec<(String, f64, u64, String)> = scores
            .into_iter()
            .map(|(candidate, base)| {
                let followers = state.follower_count(candidate);
                let score = base + ((followers + 1) as f64).ln() * MUTUAL_POPULARITY_FACTOR;
                let mut connectors = via.remove(candidate).unwrap_or_default();
                connectors.sort_unstable();
                let reason = match connectors.as_slice() {
                    [] => "mutual connections".to_string(),
                    [only] => format!("followed by {only}"),
                    [first, rest @ ..] => format!("followed by {first} and {} others", rest.len()),
                };
                (candidate.to_string(), score, followers, reason)
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.cmp(&a.2))
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .map(|(candidate_id, score, _, reason)| Recommendation {
                candidate_id,
                score,
                reason,
            })
            .collect()
    }

    /// Interest scoring: the user's distribution is the L1-normalized sum
    /// of their followees' vectors; candidates qualify above a similarity
    /// floor and score `similarity × interest_weight` plus a small
    /// popularity bonus.
    fn compute_interest(&self, user: &str) -> Vec<Recommendation> {
        let state = self.state.read();
        let Some(friends) = state.out.get(user) else {
            return Vec::new();
        };
        if friends.is_empty() {
            return Vec::new();
        }

        let mut profile: HashMap<&'static str, f64> = HashMap::new();
        for friend in friends {
            for (dim, weight) in interests::interest_vector(friend) {
                *profile.entry(dim).or_default() += weight;
            }
        }
        let total: f64 = profile.values().sum();
        if total <= 0.0 {
            return Vec::new();
        }
        for weight in profile.values_mut() {
            *weight /= total;
        }

        let mut ranked: Vec<(String, f64)> = state
            .known_users()
            .into_iter()
            .filter(|c| c.as_str() != user && !friends.contains(c.as_str()))
            .filter_map(|candidate| {
                let candidate_vec = interests::interest_vector(candidate);
                let sim = interests::similarity(&profile, &candidate_vec);
                if sim <= MIN_INTEREST_SIMILARITY {
                    return None;
                }
                let followers = state.follower_count(candidate);
                let score = sim * self.config.interest_weight
                    + ((followers + 1) as f64).ln() * INTEREST_POPULARITY_FACTOR;
                Some((candidate.clone(), score))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .map(|(candidate_id, score)| Recommendation {
                candidate_id,
                score,
                reason: "shared interests".to_string(),
            })
            .collect()
    }

    /// Trending scoring: candidates followed within the trailing week get
    /// a recency-decayed velocity times engagement; only scores above the
    /// floor qualify.
    fn compute_trending(&self, user: &str) -> Vec<Recommendation> {
        let state = self.state.read();
        let already = state.out.get(user);
        let now = Utc::now();
        let decay_hours = 24.0 * (1.0 - self.config.recency_decay_factor);

        let mut ranked: Vec<(String, f64)> = state
            .metrics
            .iter()
            .filter(|(candidate, _)| {
                candidate.as_str() != user && !already.is_some_and(|set| set.contains(candidate.as_str()))
            })
            .filter_map(|(candidate, metrics)| {
                let last = metrics.last_followed_at?;
                let hours = (now - last).num_seconds() as f64 / 3600.0;
                if !(0.0..=TRENDING_WINDOW_HOURS).contains(&hours) {
                    return None;
                }
                let recency = (-hours / decay_hours).exp();
                let velocity = metrics.follower_count as f64 * recency;
                let score = velocity * interests::engagement_score(candidate) * self.config.trending_weight;
                (score > MIN_TRENDING_SCORE).then(|| (candidate.clone(), score))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .map(|(candidate_id, score)| Recommendation {
                candidate_id,
                score,
                reason: "trending".to_string(),
            })
            .collect()
    }

    /// Hybrid composition: each signal's scores are normalized to `[0, 1]`
    /// by its own maximum, then combined with the configured weights
    /// normalized to sum to 1. The reason carries over from whichever
    /// signal contributed most.
    fn compute_hybrid(&self, user: &str) -> Vec<Recommendation> {
        let weight_total =
            self.config.mutual_friend_weight + self.config.interest_weight + self.config.trending_weight;
        if weight_total <= 0.0 {
            return Vec::new();
        }

        let signals = [
            (self.compute_mutual(user), self.config.mutual_friend_weight / weight_total),
            (self.compute_interest(user), self.config.interest_weight / weight_total),
            (self.compute_trending(user), self.config.trending_weight / weight_total),
        ];

        struct Combined {
            score: f64,
            reason: String,
            best_contribution: f64,
        }

        let mut combined: HashMap<String, Combined> = HashMap::new();
        for (recommendations, weight) in signals {
            let max = recommendations
                .iter()
                .map(|r| r.score)
                .fold(f64::MIN, f64::max);
            if recommendations.is_empty() || max <= 0.0 {
                continue;
            }
            for rec in recommendations {
                let contribution = weight * (rec.score / max);
                let entry = combined.entry(rec.candidate_id).or_insert_with(|| Combined {
                    score: 0.0,
                    reason: rec.reason.clone(),
                    best_contribution: 0.0,
                });
                entry.score += contribution;
                if contribution > entry.best_contribution {
                    entry.best_contribution = contribution;
                    entry.reason = rec.reason;
                }
            }
        }

        let mut ranked: Vec<(String, Combined)> = combined.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .map(|(candidate_id, c)| Recommendation {
                candidate_id,
                score: c.score,
                reason: c.reason,
            })
            .collect()
    }
}
