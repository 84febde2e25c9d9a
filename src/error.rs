use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the acquisition pipeline.
///
/// Transient conditions (network faults, rate limiting) are retried inside
/// the component that hit them; a variant here means the retry budget was
/// exhausted or the condition is not retryable at all.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Catalog rejected the bearer token, or the token expired. Fatal,
    /// never retried.
    #[error("catalog authentication failed: {0}")]
    Auth(String),

    /// Network-level failure that survived the retry budget.
    #[error("network request failed: {0}")]
    Network(String),

    /// Catalog rate limit held through every retry attempt.
    #[error("catalog rate limit exceeded (server hint: {retry_after:?})")]
    RateLimit { retry_after: Option<Duration> },

    /// The candidate set was empty, either because the catalog returned
    /// nothing or because every candidate was filtered out. Informative,
    /// not a fault.
    #[error("no products matched the query")]
    NoMatch,

    /// A product title did not conform to the tile grammar. Fatal for that
    /// candidate only; the caller may fall back to the next-ranked one.
    #[error("malformed product title '{title}': {reason}")]
    MalformedTitle { title: String, reason: String },

    /// The resolved prefix lists zero objects.
    #[error("no objects found under prefix '{prefix}'")]
    NotFound { prefix: String },

    /// A downloaded file does not match its expected size or checksum.
    #[error("integrity check failed for {}: {reason}", path.display())]
    Integrity { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
