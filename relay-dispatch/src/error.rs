//! # Error Types
//!
//! Two error enums cover the two seams of the dispatch core:
//!
//! - [`ProviderError`] — everything an upstream adapter can report:
//!   transport failures, credential rejection, rate limiting, missing
//!   capabilities, and provider API errors.
//! - [`DispatchError`] — what the core surfaces to callers: unknown models,
//!   exhausted failover chains, configuration mistakes, and registry
//!   conflicts. Instance-level provider errors are recovered inside the
//!   failover executor and only reach the caller wrapped in the terminal
//!   `Unavailable` trace.

use thiserror::Error;

/// Errors reported by upstream provider adapters.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP client and network communication errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API error with status code and message
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Credential rejected by the upstream (401/403)
    #[error("authentication rejected by provider")]
    Unauthenticated,

    /// Upstream rate limit hit (429)
    #[error("rate limit exceeded")]
    RateLimited,

    /// Endpoint unreachable or refusing connections
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    /// Capability not offered by this upstream
    #[error("not supported by this provider: {feature}")]
    Unimplemented { feature: String },

    /// Per-attempt deadline expired
    #[error("request timed out")]
    Timeout,

    /// Response body did not parse
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing adapter configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Unknown provider kind in configuration
    #[error("provider not supported: {kind}")]
    UnsupportedProvider { kind: String },
}

impl ProviderError {
    /// Whether this error proves the endpoint is reachable and credentialed.
    ///
    /// Used by health probes: a 4xx other than 401/403/429 means the request
    /// was understood and rejected for shape, which is good enough evidence
    /// of connectivity.
    pub fn indicates_reachable(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }
}

/// Errors surfaced by the dispatch core.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// No instances registered for the requested model
    #[error("model not found: {model}")]
    NotFound { model: String },

    /// No healthy instances, or all instances and fallbacks failed
    #[error("service unavailable: {message}")]
    Unavailable {
        message: String,
        /// Ordered failover trace accumulated during the request
        trace: Vec<String>,
    },

    /// Bad configuration: unknown strategy, conflicting route slug, etc.
    #[error("invalid: {message}")]
    Invalid { message: String },

    /// Adding an instance whose id already exists
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Transport or application error from a provider adapter
    #[error("upstream error: {0}")]
    Upstream(#[from] ProviderError),

    /// Per-attempt or caller deadline expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Caller cancelled the request
    #[error("request canceled")]
    Canceled,
}

impl DispatchError {
    pub fn unavailable(message: impl Into<String>, trace: Vec<String>) -> Self {
        DispatchError::Unavailable {
            message: message.into(),
            trace,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        DispatchError::Invalid {
            message: message.into(),
        }
    }
}
