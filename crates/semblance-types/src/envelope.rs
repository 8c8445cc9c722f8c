use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::ActionType;
use crate::error::EnvelopeError;

/// Longest request id the gateway accepts.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Hex length of an HMAC-SHA256 digest.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Signed request envelope sent by the core.
///
/// The signature covers every other field, so altering `id`, `timestamp` or
/// `action` invalidates it just as altering the payload does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActionRequest {
    pub id: String,
    /// ISO-8601 / RFC 3339 timestamp set by the core.
    pub timestamp: String,
    pub action: ActionType,
    pub payload: Value,
    pub signature: String,
}

impl ActionRequest {
    /// Decode and structurally validate a raw envelope.
    ///
    /// Payload contents are not inspected here; that is the job of the
    /// per-action payload schema.
    pub fn from_value(raw: &Value) -> Result<Self, EnvelopeError> {
        if !raw.is_object() {
            return Err(EnvelopeError::Malformed("envelope must be a JSON object".into()));
        }
        let request: ActionRequest = serde_json::from_value(raw.clone())
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// Structural checks that serde alone does not enforce.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("id"));
        }
        if self.id.len() > MAX_REQUEST_ID_LEN {
            return Err(EnvelopeError::Malformed(format!(
                "id exceeds {} bytes",
                MAX_REQUEST_ID_LEN
            )));
        }
        if self.timestamp.trim().is_empty() {
            return Err(EnvelopeError::MissingField("timestamp"));
        }
        self.parsed_timestamp()?;
        if !self.payload.is_object() {
            return Err(EnvelopeError::Malformed("payload must be a JSON object".into()));
        }
        if self.signature.is_empty() {
            return Err(EnvelopeError::MissingField("signature"));
        }
        if self.signature.len() != SIGNATURE_HEX_LEN
            || !self.signature.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(EnvelopeError::InvalidSignatureEncoding);
        }
        Ok(())
    }

    /// The envelope timestamp as UTC.
    pub fn parsed_timestamp(&self) -> Result<DateTime<Utc>, EnvelopeError> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| EnvelopeError::InvalidTimestamp(self.timestamp.clone()))
    }
}

/// Terminal status of a request as seen by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Error,
    Rejected,
    RateLimited,
    RequiresApproval,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Error => "error",
            ActionStatus::Rejected => "rejected",
            ActionStatus::RateLimited => "rate_limited",
            ActionStatus::RequiresApproval => "requires_approval",
        }
    }
}

/// Machine-readable reason attached to every non-success response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SchemaInvalid,
    PayloadInvalid,
    SignatureInvalid,
    TimestampStale,
    RequestReplayed,
    DomainNotAllowed,
    RateLimited,
    AnomalyDetected,
    ExecutionError,
    AuditUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SchemaInvalid => "SCHEMA_INVALID",
            ErrorCode::PayloadInvalid => "PAYLOAD_INVALID",
            ErrorCode::SignatureInvalid => "SIGNATURE_INVALID",
            ErrorCode::TimestampStale => "TIMESTAMP_STALE",
            ErrorCode::RequestReplayed => "REQUEST_REPLAYED",
            ErrorCode::DomainNotAllowed => "DOMAIN_NOT_ALLOWED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::AnomalyDetected => "ANOMALY_DETECTED",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::AuditUnavailable => "AUDIT_UNAVAILABLE",
        }
    }

    /// Lower-case form recorded as `rejectionReason` in audit metadata.
    pub fn rejection_reason(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// Response status that accompanies this code.
    pub fn status(&self) -> ActionStatus {
        match self {
            ErrorCode::RateLimited => ActionStatus::RateLimited,
            ErrorCode::AnomalyDetected => ActionStatus::RequiresApproval,
            ErrorCode::ExecutionError | ErrorCode::AuditUnavailable => ActionStatus::Error,
            _ => ActionStatus::Rejected,
        }
    }

    /// Integrity and authenticity failures. These are never retried.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            ErrorCode::SignatureInvalid | ErrorCode::RequestReplayed | ErrorCode::TimestampStale
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: ErrorCode,
    pub message: String,
}

/// Response envelope returned to the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    pub request_id: String,
    pub timestamp: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    /// Id of the audit entry that records this outcome.
    pub audit_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ActionResponse {
    pub fn success(
        request_id: impl Into<String>,
        data: Option<Value>,
        audit_ref: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: now_rfc3339(),
            status: ActionStatus::Success,
            data,
            error: None,
            audit_ref: audit_ref.into(),
            retry_after_ms: None,
        }
    }

    /// Non-success response; the status is derived from the code.
    pub fn failure(
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        audit_ref: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: now_rfc3339(),
            status: code.status(),
            data: None,
            error: Some(ActionError {
                code,
                message: message.into(),
            }),
            audit_ref: audit_ref.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// Current time in the wire timestamp format.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_request() -> Value {
        json!({
            "id": "r1",
            "timestamp": "2026-10-17T12:00:00.000Z",
            "action": "web.fetch",
            "payload": {"url": "https://example.com"},
            "signature": "a".repeat(64),
        })
    }

    #[test]
    fn decodes_valid_envelope() {
        let req = ActionRequest::from_value(&raw_request()).unwrap();
        assert_eq!(req.id, "r1");
        assert_eq!(req.action, ActionType::WebFetch);
        assert!(req.parsed_timestamp().is_ok());
    }

    #[test]
    fn rejects_unknown_fields_and_actions() {
        let mut raw = raw_request();
        raw["extra"] = json!(1);
        assert!(ActionRequest::from_value(&raw).is_err());

        let mut raw = raw_request();
        raw["action"] = json!("shell.exec");
        assert!(ActionRequest::from_value(&raw).is_err());
    }

    #[test]
    fn rejects_structural_problems() {
        let mut raw = raw_request();
        raw["id"] = json!("  ");
        assert!(matches!(
            ActionRequest::from_value(&raw),
            Err(EnvelopeError::MissingField("id"))
        ));

        let mut raw = raw_request();
        raw["timestamp"] = json!("yesterday");
        assert!(matches!(
            ActionRequest::from_value(&raw),
            Err(EnvelopeError::InvalidTimestamp(_))
        ));

        let mut raw = raw_request();
        raw["payload"] = json!([1, 2]);
        assert!(ActionRequest::from_value(&raw).is_err());

        let mut raw = raw_request();
        raw["signature"] = json!("zz");
        assert!(matches!(
            ActionRequest::from_value(&raw),
            Err(EnvelopeError::InvalidSignatureEncoding)
        ));

        assert!(ActionRequest::from_value(&json!("not an object")).is_err());
    }

    #[test]
    fn error_codes_map_to_statuses() {
        assert_eq!(ErrorCode::RateLimited.status(), ActionStatus::RateLimited);
        assert_eq!(ErrorCode::AnomalyDetected.status(), ActionStatus::RequiresApproval);
        assert_eq!(ErrorCode::ExecutionError.status(), ActionStatus::Error);
        assert_eq!(ErrorCode::DomainNotAllowed.status(), ActionStatus::Rejected);
        assert_eq!(ErrorCode::DomainNotAllowed.rejection_reason(), "domain_not_allowed");
        assert!(ErrorCode::RequestReplayed.is_security_relevant());
        assert!(!ErrorCode::RateLimited.is_security_relevant());
    }

    #[test]
    fn response_serializes_camel_case() {
        let resp = ActionResponse::failure("r9", ErrorCode::RateLimited, "slow down", "audit-1")
            .with_retry_after(1500);
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["requestId"], "r9");
        assert_eq!(value["status"], "rate_limited");
        assert_eq!(value["error"]["code"], "RATE_LIMITED");
        assert_eq!(value["auditRef"], "audit-1");
        assert_eq!(value["retryAfterMs"], 1500);
        assert!(value.get("data").is_none());
    }
}
