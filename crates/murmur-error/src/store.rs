/// Errors surfaced by the data-access substrate (pool, cache, executor,
/// storage drivers).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Connection not acquired within {waited_ms}ms")]
    ConnectionTimeout { waited_ms: u64 },

    #[error("Storage driver error: {message}")]
    Storage {
        message: String,
        #[source]
        source:  Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache failures are never fatal; callers degrade to the uncached
    /// path. The variant exists so the degradation can be logged with a
    /// typed cause.
    #[error("Cache failure: {message}")]
    Cache { message: String },

    #[error("Invariant violation: {message}")]
    InvariantViolation { message: String },

    #[error("Pool is shut down")]
    Shutdown,
}

impl StoreError {
    /// Get the error code for this error
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::ConnectionTimeout { .. } => "connection_timeout",
            Self::Storage { .. } => "storage_failure",
            Self::Cache { .. } => "cache_failure",
            Self::InvariantViolation { .. } => "invariant_violation",
            Self::Shutdown => "pool_shutdown",
        }
    }

    /// Convenience constructor for driver-reported failures.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source:  None,
        }
    }
}
