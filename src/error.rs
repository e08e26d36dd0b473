//! Error taxonomy for the request router
//!
//! Every failure the core surfaces is classified into one of the kinds below.
//! The classification drives retry and fallback behavior: transient upstream
//! failures are retried with backoff and may advance the fallback chain,
//! permanent failures surface immediately.

use serde::{Deserialize, Serialize};

/// Error kinds surfaced by the router core
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        /// Earliest time at which the binding limit frees a slot
        retry_after_ms: u64,
    },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient upstream failure: {0}")]
    UpstreamTransient(String),

    #[error("permanent upstream failure: {0}")]
    UpstreamPermanent(String),

    #[error("prompt ({prompt_tokens} tokens) plus max_tokens ({max_tokens}) exceeds model context of {context_tokens}")]
    ContextLength {
        prompt_tokens: u32,
        max_tokens: u32,
        context_tokens: u32,
    },

    #[error("blocked by provider safety policy: {0}")]
    SafetyBlocked(String),

    #[error("model format not supported: {0}")]
    UnsupportedFormat(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Stable kind tag used in the error wire shape and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::Validation(_) => "validation_error",
            RouterError::Auth(_) => "auth_error",
            RouterError::Permission(_) => "permission_error",
            RouterError::RateLimited { .. } => "rate_limit_error",
            RouterError::QuotaExceeded(_) => "quota_exceeded_error",
            RouterError::QueueFull(_) => "queue_full_error",
            RouterError::NotFound(_) => "not_found_error",
            RouterError::UpstreamTransient(_) => "upstream_transient",
            RouterError::UpstreamPermanent(_) => "upstream_permanent",
            RouterError::ContextLength { .. } => "context_length_error",
            RouterError::SafetyBlocked(_) => "safety_blocked",
            RouterError::UnsupportedFormat(_) => "unsupported_format_error",
            RouterError::Cancelled => "cancelled_error",
            RouterError::Internal(_) => "internal_error",
        }
    }

    /// Whether the same candidate may be retried after backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouterError::UpstreamTransient(_))
    }

    /// Whether the router may advance to the next candidate in the chain
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            RouterError::NotFound(_)
                | RouterError::UpstreamTransient(_)
                | RouterError::UpstreamPermanent(_)
                | RouterError::ContextLength { .. }
        )
    }

    /// Classify a provider HTTP status plus body into the taxonomy
    pub fn from_provider_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => RouterError::Auth(body.to_string()),
            429 => RouterError::RateLimited {
                message: body.to_string(),
                retry_after_ms: 0,
            },
            400..=499 => RouterError::UpstreamPermanent(format!("HTTP {}: {}", status, body)),
            _ => RouterError::UpstreamTransient(format!("HTTP {}: {}", status, body)),
        }
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Error wire shape: `{error: {kind, message, retryAfter?, provider?, model?, requestId}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub request_id: String,
}

impl ErrorBody {
    pub fn from_error(
        err: &RouterError,
        request_id: &str,
        provider: Option<String>,
        model: Option<String>,
    ) -> Self {
        let retry_after = match err {
            RouterError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            error: ErrorDetail {
                kind: err.kind().to_string(),
                message: err.to_string(),
                retry_after,
                provider,
                model,
                request_id: request_id.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RouterError::UpstreamTransient("timeout".into()).is_retryable());
        assert!(!RouterError::UpstreamPermanent("bad field".into()).is_retryable());
        assert!(!RouterError::Auth("no key".into()).is_retryable());
        assert!(!RouterError::Cancelled.is_retryable());
    }

    #[test]
    fn test_fallback_classification() {
        assert!(RouterError::UpstreamTransient("503".into()).allows_fallback());
        assert!(RouterError::UpstreamPermanent("422".into()).allows_fallback());
        assert!(RouterError::NotFound("gone".into()).allows_fallback());
        assert!(RouterError::ContextLength {
            prompt_tokens: 9000,
            max_tokens: 500,
            context_tokens: 8192
        }
        .allows_fallback());
        // Safety refusals never fall back
        assert!(!RouterError::SafetyBlocked("policy".into()).allows_fallback());
        assert!(!RouterError::Validation("bad".into()).allows_fallback());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            RouterError::from_provider_status(503, "unavailable"),
            RouterError::UpstreamTransient(_)
        ));
        assert!(matches!(
            RouterError::from_provider_status(422, "bad schema"),
            RouterError::UpstreamPermanent(_)
        ));
        assert!(matches!(
            RouterError::from_provider_status(401, "bad key"),
            RouterError::Auth(_)
        ));
        assert!(matches!(
            RouterError::from_provider_status(429, "slow down"),
            RouterError::RateLimited { .. }
        ));
    }

    #[test]
    fn test_error_body_shape() {
        let err = RouterError::RateLimited {
            message: "minute window".into(),
            retry_after_ms: 12_000,
        };
        let body = ErrorBody::from_error(&err, "req-1", Some("openai".into()), None);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["kind"], "rate_limit_error");
        assert_eq!(json["error"]["retry_after"], 12_000);
        assert_eq!(json["error"]["request_id"], "req-1");
        assert!(json["error"].get("model").is_none());
    }
}
