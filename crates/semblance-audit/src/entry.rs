//! Audit entry types

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use semblance_crypto::hash_canonical;
use semblance_types::ActionStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::integrity::compute_chain_hash;

/// Which side of execution an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDirection {
    Request,
    Response,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// Admitted and about to execute.
    Pending,
    Success,
    Error,
    Rejected,
    RateLimited,
    RequiresApproval,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Rejected => "rejected",
            AuditStatus::RateLimited => "rate_limited",
            AuditStatus::RequiresApproval => "requires_approval",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AuditStatus::Pending)
    }
}

impl From<ActionStatus> for AuditStatus {
    fn from(status: ActionStatus) -> Self {
        match status {
            ActionStatus::Success => AuditStatus::Success,
            ActionStatus::Error => AuditStatus::Error,
            ActionStatus::Rejected => AuditStatus::Rejected,
            ActionStatus::RateLimited => AuditStatus::RateLimited,
            ActionStatus::RequiresApproval => AuditStatus::RequiresApproval,
        }
    }
}

impl std::str::FromStr for AuditStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AuditStatus::Pending),
            "success" => Ok(AuditStatus::Success),
            "error" => Ok(AuditStatus::Error),
            "rejected" => Ok(AuditStatus::Rejected),
            "rate_limited" => Ok(AuditStatus::RateLimited),
            "requires_approval" => Ok(AuditStatus::RequiresApproval),
            other => Err(format!("unknown audit status: {}", other)),
        }
    }
}

/// A sealed audit entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Position in the chain, starting at 0.
    pub seq: u64,
    pub id: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Wire action name, or `"unknown"` when the envelope could not be read.
    pub action: String,
    pub direction: AuditDirection,
    pub status: AuditStatus,
    /// SHA-256 of the canonical payload. The payload itself is never stored.
    pub payload_hash: String,
    pub signature: String,
    pub chain_hash: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub estimated_time_saved_seconds: u64,
}

impl AuditEntry {
    /// The entry as hashed into the chain: every field except `chainHash`.
    pub fn content(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.remove("chainHash");
        }
        value
    }

    /// Recompute this entry's chain hash from the given predecessor hash.
    pub fn expected_chain_hash(&self, previous_hash: &str) -> String {
        compute_chain_hash(previous_hash, &self.content())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Error code recorded for a failed or rejected request.
    pub fn error_code(&self) -> Option<&str> {
        self.metadata_str("errorCode")
    }
}

/// An entry before it is sealed into the chain.
///
/// The payload hash is taken here; the id, timestamp, sequence number and
/// chain hash are assigned by the trail at append time.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    request_id: String,
    action: String,
    direction: AuditDirection,
    status: AuditStatus,
    payload_hash: String,
    signature: String,
    metadata: BTreeMap<String, Value>,
    estimated_time_saved_seconds: u64,
}

impl AuditRecord {
    pub fn new(
        request_id: impl Into<String>,
        action: impl Into<String>,
        direction: AuditDirection,
        status: AuditStatus,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            action: action.into(),
            direction,
            status,
            payload_hash: hash_canonical(&Value::Null),
            signature: String::new(),
            metadata: BTreeMap::new(),
            estimated_time_saved_seconds: 0,
        }
    }

    pub fn request(request_id: impl Into<String>, action: impl Into<String>, status: AuditStatus) -> Self {
        Self::new(request_id, action, AuditDirection::Request, status)
    }

    pub fn response(request_id: impl Into<String>, action: impl Into<String>, status: AuditStatus) -> Self {
        Self::new(request_id, action, AuditDirection::Response, status)
    }

    pub fn payload(mut self, payload: &Value) -> Self {
        self.payload_hash = hash_canonical(payload);
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn time_saved(mut self, seconds: u64) -> Self {
        self.estimated_time_saved_seconds = seconds;
        self
    }

    pub fn status(&self) -> AuditStatus {
        self.status
    }

    /// Seal the record as entry `seq`, linked to `previous_hash`.
    pub fn finalize(self, seq: u64, previous_hash: &str) -> AuditEntry {
        let mut entry = AuditEntry {
            seq,
            id: Uuid::new_v4().to_string(),
            request_id: self.request_id,
            // Millisecond precision keeps the serialized form stable.
            timestamp: Utc::now().trunc_subsecs(3),
            action: self.action,
            direction: self.direction,
            status: self.status,
            payload_hash: self.payload_hash,
            signature: self.signature,
            chain_hash: String::new(),
            metadata: self.metadata,
            estimated_time_saved_seconds: self.estimated_time_saved_seconds,
        };
        entry.chain_hash = entry.expected_chain_hash(previous_hash);
        entry
    }
}

/// One row of the user-facing action log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: String,
    pub request_id: String,
    pub timestamp: String,
    pub action: String,
    pub status: String,
    pub description: String,
    /// Autonomy tier the core acted under; `"unknown"` unless it recorded one.
    pub autonomy_tier: String,
    pub payload_hash: String,
    pub audit_ref: String,
    pub estimated_time_saved_seconds: u64,
}

impl From<&AuditEntry> for ActionLogEntry {
    fn from(entry: &AuditEntry) -> Self {
        let description = match entry.metadata_str("description") {
            Some(d) => d.to_string(),
            None => match (entry.status, entry.metadata_str("rejectionReason")) {
                (AuditStatus::Success, _) => format!("{} completed", entry.action),
                (status, Some(reason)) => {
                    format!("{} {}: {}", entry.action, status.as_str(), reason)
                }
                (status, None) => format!("{} {}", entry.action, status.as_str()),
            },
        };
        Self {
            id: entry.id.clone(),
            request_id: entry.request_id.clone(),
            timestamp: entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            action: entry.action.clone(),
            status: entry.status.as_str().to_string(),
            description,
            autonomy_tier: entry
                .metadata_str("autonomyTier")
                .unwrap_or("unknown")
                .to_string(),
            payload_hash: entry.payload_hash.clone(),
            audit_ref: entry.id.clone(),
            estimated_time_saved_seconds: entry.estimated_time_saved_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::GENESIS_HASH;
    use serde_json::json;

    #[test]
    fn payload_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"to":"x","subject":"y"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"subject":"y","to":"x"}"#).unwrap();
        let ra = AuditRecord::request("r1", "email.send", AuditStatus::Pending).payload(&a);
        let rb = AuditRecord::request("r1", "email.send", AuditStatus::Pending).payload(&b);
        assert_eq!(ra.payload_hash, rb.payload_hash);
    }

    #[test]
    fn finalize_links_to_previous_hash() {
        let entry = AuditRecord::request("r1", "web.fetch", AuditStatus::Pending)
            .payload(&json!({"url": "https://example.com"}))
            .metadata("stage", "execute")
            .finalize(0, GENESIS_HASH);
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.chain_hash.len(), 64);
        assert_eq!(entry.expected_chain_hash(GENESIS_HASH), entry.chain_hash);
        assert_ne!(entry.expected_chain_hash(&"f".repeat(64)), entry.chain_hash);
    }

    #[test]
    fn chain_hash_is_stable_across_serialization() {
        let entry = AuditRecord::response("r1", "web.fetch", AuditStatus::Success)
            .time_saved(30)
            .finalize(3, GENESIS_HASH);
        let line = serde_json::to_string(&entry).unwrap();
        let reloaded: AuditEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(reloaded, entry);
        let first = reloaded.expected_chain_hash(GENESIS_HASH);
        let second = reloaded.expected_chain_hash(GENESIS_HASH);
        assert_eq!(first, second);
        assert_eq!(first, entry.chain_hash);
    }

    #[test]
    fn entry_serializes_camel_case() {
        let entry = AuditRecord::request("r1", "web.fetch", AuditStatus::Rejected)
            .metadata("rejectionReason", "domain_not_allowed")
            .finalize(0, GENESIS_HASH);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["status"], "rejected");
        assert_eq!(value["direction"], "request");
        assert_eq!(value["metadata"]["rejectionReason"], "domain_not_allowed");
        assert!(entry.content().get("chainHash").is_none());
    }

    #[test]
    fn action_log_describes_rejections() {
        let entry = AuditRecord::request("r1", "web.fetch", AuditStatus::Rejected)
            .metadata("rejectionReason", "domain_not_allowed")
            .finalize(0, GENESIS_HASH);
        let row = ActionLogEntry::from(&entry);
        assert_eq!(row.description, "web.fetch rejected: domain_not_allowed");
        assert_eq!(row.audit_ref, entry.id);
        assert_eq!(row.autonomy_tier, "unknown");
    }

    #[test]
    fn action_log_row_uses_snake_case_names() {
        let entry = AuditRecord::response("r2", "email.send", AuditStatus::Success)
            .metadata("autonomyTier", "partner")
            .time_saved(120)
            .finalize(1, GENESIS_HASH);
        let value = serde_json::to_value(ActionLogEntry::from(&entry)).unwrap();
        for field in [
            "id",
            "timestamp",
            "action",
            "status",
            "description",
            "autonomy_tier",
            "payload_hash",
            "audit_ref",
            "estimated_time_saved_seconds",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["autonomy_tier"], "partner");
        assert_eq!(value["estimated_time_saved_seconds"], 120);
    }
}
