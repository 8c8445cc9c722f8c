use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt audit record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("audit store disabled: could not roll back a failed append to {path}")]
    Poisoned { path: String },
}

pub type Result<T> = std::result::Result<T, AuditError>;
