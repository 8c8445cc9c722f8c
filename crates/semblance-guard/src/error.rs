use thiserror::Error;

/// Errors from the admission controls.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("timestamp is {skew_ms}ms old, freshness window is {ttl_ms}ms")]
    TimestampStale { skew_ms: i64, ttl_ms: i64 },

    #[error("timestamp is {skew_ms}ms in the future, freshness window is {ttl_ms}ms")]
    TimestampFuture { skew_ms: i64, ttl_ms: i64 },
}
