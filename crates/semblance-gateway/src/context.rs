use chrono::{DateTime, Utc};
use semblance_guard::AnomalyFinding;
use semblance_types::envelope::MAX_REQUEST_ID_LEN;
use semblance_types::{ActionRequest, ErrorCode};
use serde_json::Value;

use crate::error::GatewayError;

/// Why a stage stopped the request.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub code: ErrorCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl Rejection {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

/// Result of a single stage evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutcome {
    /// Continue to the next stage.
    Pass,
    /// Stop here. Anomaly escalations use this too, with
    /// `ANOMALY_DETECTED`, which maps to `requires_approval`.
    Reject(Rejection),
}

impl StageOutcome {
    pub fn reject(code: ErrorCode, message: impl Into<String>) -> Self {
        StageOutcome::Reject(Rejection::new(code, message))
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, StageOutcome::Pass)
    }
}

/// State carried through the stages for one request.
pub struct ValidationContext {
    /// The envelope exactly as received.
    pub raw: Value,
    /// Gateway clock reading taken on arrival; every stage judges against it.
    pub received_at: DateTime<Utc>,
    /// Decoded envelope (set by the envelope stage).
    pub request: Option<ActionRequest>,
    /// Parsed envelope timestamp (set by the envelope stage).
    pub timestamp: Option<DateTime<Utc>>,
    /// Derived target host (set by the payload stage). `None` for local actions.
    pub target_domain: Option<String>,
    /// Findings from the anomaly stage, blocking or not.
    pub anomalies: Vec<AnomalyFinding>,
}

impl ValidationContext {
    pub fn new(raw: Value, received_at: DateTime<Utc>) -> Self {
        Self {
            raw,
            received_at,
            request: None,
            timestamp: None,
            target_domain: None,
            anomalies: Vec::new(),
        }
    }

    /// The decoded envelope, or an error naming the stage that needed it.
    pub fn request(&self, stage: &'static str) -> Result<&ActionRequest, GatewayError> {
        self.request.as_ref().ok_or(GatewayError::EnvelopeMissing(stage))
    }

    /// Request id for auditing, falling back to the raw field when the
    /// envelope did not decode.
    pub fn request_id(&self) -> String {
        if let Some(req) = &self.request {
            return req.id.clone();
        }
        match self.raw.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.chars().take(MAX_REQUEST_ID_LEN).collect(),
            _ => "unknown".to_string(),
        }
    }

    pub fn action_name(&self) -> String {
        if let Some(req) = &self.request {
            return req.action.as_str().to_string();
        }
        match self.raw.get("action").and_then(Value::as_str) {
            Some(a) if !a.is_empty() => a.chars().take(64).collect(),
            _ => "unknown".to_string(),
        }
    }

    pub fn payload(&self) -> &Value {
        match &self.request {
            Some(req) => &req.payload,
            None => self.raw.get("payload").unwrap_or(&Value::Null),
        }
    }

    pub fn signature(&self) -> &str {
        match &self.request {
            Some(req) => &req.signature,
            None => self.raw.get("signature").and_then(Value::as_str).unwrap_or(""),
        }
    }
}
