//! Adapter errors and the tagged failure the council sees.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the OpenRouter adapter.
///
/// These never leave the gateway: [`super::ProviderGateway`] folds them into a
/// [`CallFailure`] before the council pipeline sees them.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Missing API key, bad header value, client construction.
    #[error("configuration error: {0}")]
    Config(String),

    /// Refused locally; nothing was sent.
    #[error("request not sent: {0}")]
    Rejected(String),

    /// Non-2xx answer from the provider.
    #[error("openrouter http {status}: {message}")]
    Status {
        status: u16,
        message: String,
        provider_code: Option<String>,
        request_id: Option<String>,
    },

    /// 2xx answer the adapter cannot use (bad JSON, no choices, empty content).
    #[error("unusable openrouter response: {message}")]
    Body {
        message: String,
        request_id: Option<String>,
    },

    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    pub(crate) fn body(message: impl Into<String>, request_id: Option<&str>) -> Self {
        Self::Body {
            message: message.into(),
            request_id: request_id.map(str::to_string),
        }
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Rejected(_) => "rejected",
            Self::Status { status: 429, .. } => "rate_limited",
            Self::Status { .. } => "http_error",
            Self::Body { .. } => "malformed_response",
            Self::Transport(e) if e.is_timeout() => "timeout",
            Self::Transport(_) => "transport_error",
        }
    }

    /// `x-request-id` of the failing response, when there was one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Status { request_id, .. } | Self::Body { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }
}

/// Tagged outcome of a failed model call, as seen by the council.
///
/// A `CallFailure` is a soft failure for that one call. It is logged and
/// recorded, never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl CallFailure {
    /// Short reason code used in telemetry and job metadata.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Http { .. } => "http_error",
            Self::Transport(_) => "transport_error",
            Self::Malformed(_) => "malformed_response",
        }
    }

    /// Fold an adapter error into the tagged failure. `timeout` is the
    /// per-call budget, reported when the HTTP client itself timed out.
    pub fn from_provider(err: ProviderError, timeout: Duration) -> Self {
        match err {
            ProviderError::Status {
                status, message, ..
            } => Self::Http { status, message },
            ProviderError::Body { message, .. } => Self::Malformed(message),
            ProviderError::Transport(e) if e.is_timeout() => Self::Timeout(timeout),
            ProviderError::Transport(e) => match e.status() {
                Some(status) => Self::Http {
                    status: status.as_u16(),
                    message: e.to_string(),
                },
                None => Self::Transport(e.to_string()),
            },
            ProviderError::Config(message) | ProviderError::Rejected(message) => {
                Self::Transport(message)
            }
        }
    }
}
