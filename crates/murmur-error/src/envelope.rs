use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MurmurError;

/// Response envelope returned by the service layer.
///
/// Every service operation resolves to one of these; transports serialize
/// it directly. `error_code` is stable across releases (clients branch on
/// it), `message` is human-readable and may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Whether the operation succeeded.
    pub success: bool,

    /// Stable machine-readable error code; `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable outcome description.
    pub message: String,

    /// When the envelope was produced (millisecond precision).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Operation payload; `None` on failure and for bare acknowledgements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    /// Successful envelope with a payload.
    #[must_use]
    pub fn ok(data: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            success:    true,
            error_code: None,
            message:    message.into(),
            timestamp:  Utc::now(),
            data:       Some(data),
        }
    }

    /// Successful envelope without a payload.
    #[must_use]
    pub fn ok_empty(message: impl Into<String>) -> Self {
        Self {
            success:    true,
            error_code: None,
            message:    message.into(),
            timestamp:  Utc::now(),
            data:       None,
        }
    }

    /// Failure envelope from an explicit code and message.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success:    false,
            error_code: Some(code.into()),
            message:    message.into(),
            timestamp:  Utc::now(),
            data:       None,
        }
    }
}

impl From<&MurmurError> for ResponseEnvelope {
    fn from(err: &MurmurError) -> Self {
        Self::error(err.error_code(), err.to_string())
    }
}
