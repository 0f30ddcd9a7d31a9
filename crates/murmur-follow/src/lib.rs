//! murmur-follow: the social-graph follow domain.
//!
//! [`repository::FollowRepository`] is the durable layer: follow edges,
//! block and mute records, pagination, bulk operations and analytics, all
//! executed through the cached executor from `murmur-db`. On top of it,
//! [`service::FollowService`] orchestrates validation, rate limiting,
//! permission rules, the in-memory graph mirror, and relationship events.

pub mod events;
pub mod models;
pub mod rate_limit;
pub mod repository;
pub mod service;

pub use events::{RelationshipEvent, RelationshipEventKind, RelationshipEventSink};
pub use models::{Follow, FollowType, NotificationLevel, PrivacyLevel, Relationship};
pub use repository::FollowRepository;
pub use service::FollowService;
