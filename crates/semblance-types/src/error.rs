use thiserror::Error;

/// Errors raised while decoding or validating an action envelope.
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("envelope is malformed: {0}")]
    Malformed(String),

    #[error("missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("unknown action type: {0}")]
    UnknownAction(String),

    #[error("timestamp is not ISO-8601: {0}")]
    InvalidTimestamp(String),

    #[error("signature is not a hex-encoded HMAC-SHA256 digest")]
    InvalidSignatureEncoding,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
