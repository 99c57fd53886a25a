//! The `Service` trait -- the collaborator interface every analysis plugin
//! implements.
//!
//! The trait is intentionally object-safe so it can be stored as
//! `Box<dyn Service>` in the [`super::ServiceRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Closed, per-request configuration passed to a service invocation.
///
/// Spec §9 flags dynamic "config objects with open-ended keys" as a pattern
/// requiring re-architecture; this is the closed replacement. Unknown
/// fields are rejected at deserialization (`serde`'s default behavior
/// already refuses unknown top-level keys is opt-in via `deny_unknown_fields`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// Upper bound on crawl depth, consulted by e.g. `backlinks`/`schema`.
    pub max_depth: Option<u32>,
    /// Locale hint for `multiLanguage`.
    pub locale: Option<String>,
}

/// Successful outcome of a service invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOutcome {
    pub result: serde_json::Value,
}

/// Classification tag for a failed service invocation, per spec §6/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Network,
    InvalidInput,
    Upstream4xx,
    Upstream5xx,
    Unknown,
}

impl ErrorKind {
    /// Wire code written into `ServiceExecution.error_code`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Upstream4xx => "UPSTREAM_4XX",
            Self::Upstream5xx => "UPSTREAM_5XX",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether this class of failure is retryable, per spec §4.G/§7.
    pub fn retryable(self) -> bool {
        !matches!(self, Self::InvalidInput | Self::Upstream4xx)
    }
}

/// An error raised by a service collaborator. Unclassified errors default
/// to `Unknown` (retryable) per spec §6.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

/// Adapter interface for a single SEO analysis service (accessibility,
/// backlinks, schema, ...).
///
/// # Object Safety
///
/// This trait is object-safe: every method returns a concrete or boxed
/// type, so `Box<dyn Service>` can be stored in [`super::ServiceRegistry`].
#[async_trait]
pub trait Service: Send + Sync {
    /// The catalogue name this service answers to (e.g. "accessibility").
    fn name(&self) -> &str;

    /// Run the analysis against `normalized_url`. Implementations should
    /// never panic; the executor treats a panic as a process bug, not a
    /// classified service error.
    async fn run(
        &self,
        normalized_url: &str,
        config: &ServiceConfig,
    ) -> Result<ServiceOutcome, ServiceError>;
}

// Compile-time assertion: Service must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Service) {}
};
