#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Validation error in {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("Invalid connection string: {message}")]
    InvalidConnectionString { message: String },

    #[error("Unsupported sslmode: {value}")]
    UnsupportedSslMode { value: String },
}

impl ConfigError {
    /// Get the error code for this error
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "config_validation_error",
            Self::InvalidConnectionString { .. } => "config_invalid_connection_string",
            Self::UnsupportedSslMode { .. } => "config_unsupported_sslmode",
        }
    }

    /// Convenience constructor for field-level validation failures.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field:   field.into(),
            message: message.into(),
        }
    }
}
