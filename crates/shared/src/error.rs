//! Shared error types including RFC7807 Problem Details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC7807 Problem Details (application/problem+json)
///
/// The messaging service answers failed `/api/*` calls with this envelope; the
/// fallback sender turns it into a readable retry reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    /// A URI reference that identifies the problem type.
    #[serde(rename = "type")]
    pub type_url: String,
    /// A short, human-readable summary of the problem type.
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// A URI reference that identifies the specific occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self {
            type_url: "https://chatwire.dev/problems/unauthorized".to_string(),
            title: "Unauthorized".to_string(),
            status: 401,
            detail: Some(detail.into()),
            instance: None,
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self {
            type_url: "https://chatwire.dev/problems/forbidden".to_string(),
            title: "Forbidden".to_string(),
            status: 403,
            detail: Some(detail.into()),
            instance: None,
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            type_url: "https://chatwire.dev/problems/not-found".to_string(),
            title: "Not Found".to_string(),
            status: 404,
            detail: Some(detail.into()),
            instance: None,
        }
    }
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// Error returned by HTTP calls to the backend services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

impl ApiError {
    /// A short reason suitable for showing next to a failed message.
    pub fn user_reason(&self) -> String {
        match self {
            ApiError::Http { status, body } => {
                try_problem_detail(body).unwrap_or_else(|| format!("HTTP {status}"))
            }
            other => other.to_string(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Http { status: 401, .. })
    }
}

/// A frame that could not be decoded or encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
}
