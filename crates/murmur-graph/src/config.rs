//! Graph engine configuration.

use std::str::FromStr;

use murmur_error::{ConfigError, GraphError};
use serde::{Deserialize, Serialize};

/// Recommendation algorithm selector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationAlgorithm {
    /// Friends-of-friends weighted by shared connections.
    Mutual,
    /// Similarity over interest vectors.
    Interests,
    /// Recent follow velocity times engagement.
    Trending,
    /// Weighted composition of the other three.
    Hybrid,
}

impl RecommendationAlgorithm {
    /// Get the algorithm as its wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mutual => "mutual",
            Self::Interests => "interests",
            Self::Trending => "trending",
            Self::Hybrid => "hybrid",
        }
    }

    /// Recommendation-cache key prefix for this algorithm.
    #[must_use]
    pub const fn cache_prefix(&self) -> &'static str {
        match self {
            Self::Mutual => "mutual_recs",
            Self::Interests => "interest_recs",
            Self::Trending => "trending_recs",
            Self::Hybrid => "hybrid_recs",
        }
    }
}

impl FromStr for RecommendationAlgorithm {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mutual" | "mutual_friends" => Ok(Self::Mutual),
            "interests" | "interest" => Ok(Self::Interests),
            "trending" => Ok(Self::Trending),
            "hybrid" | "default" => Ok(Self::Hybrid),
            other => Err(GraphError::UnknownAlgorithm {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for RecommendationAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for the social graph engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Cap on recommendations returned per request.
    pub max_recommendations: usize,

    /// TTL for recommendation-cache entries.
    pub cache_ttl_seconds: u64,

    /// Whether repository writes are mirrored into the graph as they
    /// happen (as opposed to periodic rebuilds).
    pub enable_real_time_updates: bool,

    /// Algorithm used when the caller does not pick one.
    pub algorithm_type: RecommendationAlgorithm,

    /// Score added per shared connection in mutual-friend scoring.
    pub mutual_friend_weight: f64,

    /// Multiplier for interest-similarity scores.
    pub interest_weight: f64,

    /// Multiplier for trending scores.
    pub trending_weight: f64,

    /// Recency decay for trending velocity (0.0 to 1.0; higher decays
    /// faster).
    pub recency_decay_factor: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_recommendations: 100,
            cache_ttl_seconds: 300,
            enable_real_time_updates: true,
            algorithm_type: RecommendationAlgorithm::Hybrid,
            mutual_friend_weight: 1.0,
            interest_weight: 0.8,
            trending_weight: 0.6,
            recency_decay_factor: 0.9,
        }
    }
}

impl GraphConfig {
    /// Validate bounds. Called by the engine constructor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_recommendations == 0 {
            return Err(ConfigError::validation("max_recommendations", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.recency_decay_factor) {
            return Err(ConfigError::validation(
                "recency_decay_factor",
                "must be within [0, 1)",
            ));
        }
        for (field, value) in [
            ("mutual_friend_weight", self.mutual_friend_weight),
            ("interest_weight", self.interest_weight),
            ("trending_weight", self.trending_weight),
        ] {
            if value < 0.0 {
                return Err(ConfigError::validation(field, "must be >= 0"));
            }
        }
        Ok(())
    }
}
