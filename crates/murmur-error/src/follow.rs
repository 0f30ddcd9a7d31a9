/// Errors surfaced by the follow repository and service.
#[derive(Debug, thiserror::Error)]
pub enum FollowError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Users cannot follow themselves")]
    SelfFollow,

    #[error("Invalid user id: {id}")]
    InvalidUserId { id: String },

    #[error("Bulk operation exceeds limit: {requested} > {max}")]
    BulkLimitExceeded { requested: usize, max: usize },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limit exceeded for {action}")]
    RateLimited {
        action:      String,
        retry_after: Option<u64>,
    },
}

impl FollowError {
    /// Get the error code for this error
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. }
            | Self::SelfFollow
            | Self::InvalidUserId { .. }
            | Self::BulkLimitExceeded { .. } => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}
