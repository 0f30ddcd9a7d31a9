//! Unified error types for Murmur runtime crates.
//!
//! All runtime crates depend on this crate for error handling.

// Error variants and fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

mod config;
mod envelope;
mod follow;
mod graph;
mod store;

pub use config::ConfigError;
pub use envelope::ResponseEnvelope;
pub use follow::FollowError;
pub use graph::GraphError;
pub use store::StoreError;

/// Unified error type wrapping all domain errors
#[derive(Debug, thiserror::Error)]
pub enum MurmurError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Follow(#[from] FollowError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source:  Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl MurmurError {
    /// Get the error code for this error
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.error_code(),
            Self::Store(e) => e.error_code(),
            Self::Graph(e) => e.error_code(),
            Self::Follow(e) => e.error_code(),
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Whether the operation that produced this error is worth retrying.
    ///
    /// Only connection-wait timeouts qualify; invalid input, permission
    /// failures and storage errors are surfaced without retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(StoreError::ConnectionTimeout { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let err: MurmurError = StoreError::ConnectionTimeout { waited_ms: 5000 }.into();
        assert_eq!(err.error_code(), "connection_timeout");

        let err: MurmurError = FollowError::SelfFollow.into();
        assert_eq!(err.error_code(), "invalid_input");
    }

    #[test]
    fn timeout_is_retryable() {
        let err: MurmurError = StoreError::ConnectionTimeout { waited_ms: 100 }.into();
        assert!(err.is_retryable());

        let err: MurmurError = FollowError::NotFound {
            resource: "follow".into(),
        }
        .into();
        assert!(!err.is_retryable());
    }
}
