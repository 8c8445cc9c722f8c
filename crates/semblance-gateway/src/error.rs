use semblance_audit::AuditError;
use semblance_types::ActionType;
use thiserror::Error;

/// Errors raised while assembling or running the pipeline.
///
/// None of these ever reach the core: request processing turns every failure
/// into an `ActionResponse`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid payload schema for {action}: {reason}")]
    InvalidSchema { action: ActionType, reason: String },

    #[error("stage {0} ran before the envelope was decoded")]
    EnvelopeMissing(&'static str),

    #[error("audit trail error: {0}")]
    Audit(#[from] AuditError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
