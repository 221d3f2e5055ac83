//! Error types.

use thiserror::Error;

/// A `Result` typedef to use with the [`ProxyError`] type
pub type Result<T> = std::result::Result<T, ProxyError>;

/// The error type shared across the proxy pipeline
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The client or origin sent something that does not parse as HTTP
    #[error("malformed http message: {0}")]
    BadMessage(String),
    /// The origin did not answer within the configured window
    #[error("origin request for {uri} timed out ({seconds}s)")]
    Timeout {
        /// Request path that was in flight
        uri: String,
        /// Configured origin timeout
        seconds: u64,
    },
    /// The origin connection failed or produced no usable response
    #[error("origin fetch failed: {0}")]
    OriginFailure(String),
    /// A key-value or database backend could not be reached
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// A templating directive could not be parsed
    #[error("could not parse expression: [{0}]")]
    TemplateParse(String),
    /// Error from the underlying socket or file
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Error from value (de)serialization
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Failure of a single page fetch.
///
/// Page fetches are shared between concurrent callers, so their error arm
/// must be cloneable; this is the small subset of [`ProxyError`] an origin
/// fetch can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The origin did not answer in time
    Timeout,
    /// The origin connection failed or returned garbage
    Origin(String),
}

impl FetchFailure {
    /// Upgrade into a [`ProxyError`] for the request that was being served.
    pub fn into_error(self, uri: &str, timeout_seconds: u64) -> ProxyError {
        match self {
            FetchFailure::Timeout => ProxyError::Timeout {
                uri: uri.to_string(),
                seconds: timeout_seconds,
            },
            FetchFailure::Origin(reason) => ProxyError::OriginFailure(reason),
        }
    }
}
