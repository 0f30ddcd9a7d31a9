//! murmur-graph: the in-memory social graph engine.
//!
//! A bidirectional follow graph (`out` and `in` adjacency indexes) with
//! per-user counters, O(1) edge operations, breadth-first path search,
//! influence scoring, and three recommendation pipelines (mutual-friends,
//! interest-based, trending) plus their hybrid composition. Recommendation
//! results are cached per `(algorithm, user)` with a fixed TTL and
//! invalidated whenever either endpoint of an edge changes.
//!
//! The engine is process-local: durable follow state lives in the follow
//! repository, which mirrors every mutation into this graph.

pub mod config;
pub mod engine;
pub mod interests;
mod recommend;

pub use config::{GraphConfig, RecommendationAlgorithm};
pub use engine::{GraphMetrics, Recommendation, SocialGraph, UserMetrics};
