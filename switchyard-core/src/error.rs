//! Error types for the dispatch engine and provider adapters.
//!
//! Two layers, mirroring the call structure: [`AdapterError`] is what a
//! single upstream attempt can produce (transport, HTTP status, parse,
//! timeout, cancellation), and [`DispatchError`] is what a whole request
//! can produce after the candidate loop has run its course. Between the
//! two sits [`FailureClass`], the classification that decides whether an
//! attempt is retried, whether the loop fails over, and how long the
//! provider cools down.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Error produced by a single attempt against one upstream provider.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// HTTP client and network communication errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from the provider, with the extracted message
    #[error("api error: {status} - {message}")]
    Api { status: u16, message: String },

    /// The provider returned a well-formed-looking frame we could not parse
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The attempt exceeded its per-attempt timeout
    #[error("attempt timed out")]
    Timeout,

    /// The request-scoped cancellation token fired
    #[error("cancelled")]
    Cancelled,

    /// Invalid or missing adapter/provider configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl AdapterError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Api { status, .. } => Some(*status),
            AdapterError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Short description safe to surface to callers: never includes
    /// upstream response bodies.
    pub fn summary(&self) -> String {
        match self {
            AdapterError::Api { status, .. } => format!("upstream status {status}"),
            AdapterError::Http(e) if e.is_timeout() => "transport timeout".to_string(),
            AdapterError::Http(e) if e.is_connect() => "connection failed".to_string(),
            AdapterError::Http(_) => "transport error".to_string(),
            AdapterError::Parse(_) => "malformed upstream response".to_string(),
            AdapterError::Timeout => "attempt timed out".to_string(),
            AdapterError::Cancelled => "cancelled".to_string(),
            AdapterError::Configuration { .. } => "provider misconfigured".to_string(),
        }
    }
}

/// Classification of an attempt failure.
///
/// Drives three independent decisions in the dispatch loop: whether the
/// resilience pipeline may retry the attempt, whether the loop fails over
/// to the next candidate, and the cooldown applied to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Upstream 400/404: the request itself is bad. Surfaced to the
    /// caller immediately; the provider is not penalised and the loop
    /// does not fail over (the next candidate would reproduce it).
    RequestError,
    /// Upstream 401: credential problem, long cooldown, fail over.
    Auth,
    /// Upstream 429: short cooldown, fail over.
    RateLimited,
    /// Upstream 5xx, transport failure or parse error: retryable once,
    /// then fail over with a short cooldown.
    Upstream,
    /// Per-attempt timeout: treated like an upstream failure.
    Timeout,
    /// The caller went away; stop everything.
    Cancelled,
}

impl FailureClass {
    pub fn classify(error: &AdapterError) -> Self {
        match error {
            AdapterError::Api { status, .. } => match status {
                400 | 404 => FailureClass::RequestError,
                401 => FailureClass::Auth,
                429 => FailureClass::RateLimited,
                _ => FailureClass::Upstream,
            },
            AdapterError::Http(e) if e.is_timeout() => FailureClass::Timeout,
            AdapterError::Http(_) => FailureClass::Upstream,
            AdapterError::Parse(_) => FailureClass::Upstream,
            AdapterError::Timeout => FailureClass::Timeout,
            AdapterError::Cancelled => FailureClass::Cancelled,
            AdapterError::Configuration { .. } => FailureClass::Upstream,
        }
    }

    /// Cooldown applied to the provider's health entry, or `None` when
    /// the failure says nothing about provider health.
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            FailureClass::Auth => Some(Duration::from_secs(3600)),
            FailureClass::RateLimited => Some(Duration::from_secs(60)),
            FailureClass::Upstream | FailureClass::Timeout => Some(Duration::from_secs(30)),
            FailureClass::RequestError | FailureClass::Cancelled => None,
        }
    }

    /// Whether the resilience pipeline may retry an attempt that failed
    /// with this class.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureClass::Upstream | FailureClass::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RequestError => "request_error",
            FailureClass::Auth => "auth",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Upstream => "upstream",
            FailureClass::Timeout => "timeout",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failed candidate attempt, recorded by the dispatch loop.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub provider: String,
    pub class: FailureClass,
    /// Redacted summary; never contains upstream response bodies.
    pub message: String,
}

/// Aggregate of every candidate failure for a single request.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub model: String,
    pub attempts: Vec<AttemptFailure>,
}

impl FailureReport {
    /// Caller-visible class of the aggregate: authentication if every
    /// candidate failed auth, rate-limited if every candidate was rate
    /// limited, otherwise a generic upstream failure.
    pub fn dominant_class(&self) -> FailureClass {
        let all = |class: FailureClass| {
            !self.attempts.is_empty() && self.attempts.iter().all(|a| a.class == class)
        };
        if all(FailureClass::Auth) {
            FailureClass::Auth
        } else if all(FailureClass::RateLimited) {
            FailureClass::RateLimited
        } else {
            FailureClass::Upstream
        }
    }
}

/// Terminal error for a dispatched request.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The incoming request is malformed (missing model, empty messages)
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The resolver produced zero candidates for this model
    #[error("no provider can serve model '{model}'")]
    ModelUnavailable { model: String },

    /// A provider rejected the request as bad (400/404); surfaced
    /// directly because every other candidate would reproduce it
    #[error("provider '{provider}' rejected the request: {source}")]
    Rejected {
        provider: String,
        #[source]
        source: AdapterError,
    },

    /// An already-started stream failed mid-flight; no fallback is
    /// attempted because partial output has been observed
    #[error("stream from provider '{provider}' aborted: {source}")]
    StreamAborted {
        provider: String,
        #[source]
        source: AdapterError,
    },

    /// Every eligible candidate failed
    #[error("all providers failed for model '{}' after {} attempts", .0.model, .0.attempts.len())]
    AllProvidersFailed(FailureReport),

    /// The request-scoped cancellation token fired
    #[error("request cancelled")]
    Cancelled,
}
