//! Action catalog: the per-action payload schema, target-domain rule and
//! time-saved estimate, held as data.
//!
//! Built-in defaults cover every [`ActionType`]; configuration may override
//! any part of any entry.

use std::collections::{BTreeMap, HashMap};

use jsonschema::JSONSchema;
use semblance_types::ActionType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::{Host, Url};

use crate::error::{GatewayError, Result};

/// How an action's target domain is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainRule {
    /// Always contacts the same host.
    Fixed { domain: String },
    /// Host of the URL in payload field `field`.
    PayloadUrl { field: String },
    /// Payload field `field` is itself a hostname.
    PayloadHost { field: String },
    /// Never leaves the device; the allowlist is not consulted.
    Local,
}

impl DomainRule {
    fn fixed(domain: &str) -> Self {
        DomainRule::Fixed {
            domain: domain.to_string(),
        }
    }

    fn url(field: &str) -> Self {
        DomainRule::PayloadUrl {
            field: field.to_string(),
        }
    }

    fn host(field: &str) -> Self {
        DomainRule::PayloadHost {
            field: field.to_string(),
        }
    }

    /// Resolve the target host for `payload`. `Ok(None)` means local-only.
    pub fn resolve(&self, payload: &Value) -> std::result::Result<Option<String>, String> {
        match self {
            DomainRule::Local => Ok(None),
            DomainRule::Fixed { domain } => Ok(Some(domain.to_ascii_lowercase())),
            DomainRule::PayloadUrl { field } => {
                let raw = string_field(payload, field)?;
                let url = Url::parse(raw).map_err(|e| format!("field '{}' is not a URL: {}", field, e))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(format!("field '{}' must be an http(s) URL", field));
                }
                url.host_str()
                    .map(|h| Some(h.trim_end_matches('.').to_ascii_lowercase()))
                    .ok_or_else(|| format!("field '{}' has no host", field))
            }
            DomainRule::PayloadHost { field } => {
                let raw = string_field(payload, field)?;
                let host = Host::parse(raw.trim())
                    .map_err(|e| format!("field '{}' is not a hostname: {}", field, e))?;
                Ok(Some(host.to_string().trim_end_matches('.').to_ascii_lowercase()))
            }
        }
    }
}

fn string_field<'a>(payload: &'a Value, field: &str) -> std::result::Result<&'a str, String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing string field '{}'", field))
}

/// Catalog entry in its configuration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub domain_rule: DomainRule,
    /// JSON Schema the payload must satisfy.
    pub payload_schema: Value,
    #[serde(default)]
    pub estimated_time_saved_seconds: u64,
}

/// Partial entry from configuration, merged over the default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOverride {
    #[serde(default)]
    pub domain_rule: Option<DomainRule>,
    #[serde(default)]
    pub payload_schema: Option<Value>,
    #[serde(default)]
    pub estimated_time_saved_seconds: Option<u64>,
}

impl ActionSpec {
    fn apply(&mut self, over: &ActionOverride) {
        if let Some(rule) = &over.domain_rule {
            self.domain_rule = rule.clone();
        }
        if let Some(schema) = &over.payload_schema {
            self.payload_schema = schema.clone();
        }
        if let Some(secs) = over.estimated_time_saved_seconds {
            self.estimated_time_saved_seconds = secs;
        }
    }
}

struct CatalogEntry {
    spec: ActionSpec,
    schema: JSONSchema,
}

/// Compiled catalog consulted by the payload, allowlist and execute steps.
pub struct ActionCatalog {
    entries: HashMap<ActionType, CatalogEntry>,
}

impl ActionCatalog {
    /// Compile `specs`. Actions without a spec are rejected at payload
    /// validation.
    pub fn from_specs(specs: BTreeMap<ActionType, ActionSpec>) -> Result<Self> {
        let mut entries = HashMap::with_capacity(specs.len());
        for (action, spec) in specs {
            let schema = JSONSchema::compile(&spec.payload_schema).map_err(|e| {
                GatewayError::InvalidSchema {
                    action,
                    reason: e.to_string(),
                }
            })?;
            entries.insert(action, CatalogEntry { spec, schema });
        }
        Ok(Self { entries })
    }

    pub fn defaults() -> Result<Self> {
        Self::from_specs(default_specs())
    }

    /// Built-in catalog with configuration overrides applied.
    pub fn with_overrides(overrides: &BTreeMap<ActionType, ActionOverride>) -> Result<Self> {
        let mut specs = default_specs();
        for (action, over) in overrides {
            if let Some(spec) = specs.get_mut(action) {
                spec.apply(over);
            }
        }
        Self::from_specs(specs)
    }

    pub fn spec(&self, action: ActionType) -> Option<&ActionSpec> {
        self.entries.get(&action).map(|e| &e.spec)
    }

    /// Validate `payload` against the action's schema. On failure returns
    /// one message per violation, naming the offending path but never the
    /// offending value.
    pub fn validate_payload(
        &self,
        action: ActionType,
        payload: &Value,
    ) -> std::result::Result<(), Vec<String>> {
        let entry = self
            .entries
            .get(&action)
            .ok_or_else(|| vec![format!("no catalog entry for {}", action)])?;
        entry.schema.validate(payload).map_err(|errors| {
            errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    let path = if path.is_empty() { "/".to_string() } else { path };
                    format!("{}: schema violation ({})", path, e.schema_path)
                })
                .collect()
        })
    }

    pub fn target_domain(
        &self,
        action: ActionType,
        payload: &Value,
    ) -> std::result::Result<Option<String>, String> {
        match self.entries.get(&action) {
            Some(entry) => entry.spec.domain_rule.resolve(payload),
            None => Err(format!("no catalog entry for {}", action)),
        }
    }

    pub fn time_saved(&self, action: ActionType) -> u64 {
        self.entries
            .get(&action)
            .map(|e| e.spec.estimated_time_saved_seconds)
            .unwrap_or(0)
    }
}

fn object(required: &[&str], properties: Value) -> Value {
    json!({
        "type": "object",
        "required": required,
        "properties": properties,
    })
}

fn spec(domain_rule: DomainRule, payload_schema: Value, secs: u64) -> ActionSpec {
    ActionSpec {
        domain_rule,
        payload_schema,
        estimated_time_saved_seconds: secs,
    }
}

/// Built-in entry for every action type.
pub fn default_specs() -> BTreeMap<ActionType, ActionSpec> {
    let host = json!({"type": "string", "minLength": 1});
    let text = json!({"type": "string"});
    let nonempty = json!({"type": "string", "minLength": 1});
    let recipients = json!({"type": "array", "items": {"type": "string", "minLength": 3}, "minItems": 1});

    let mut specs = BTreeMap::new();
    for action in ActionType::ALL {
        let entry = match action {
            ActionType::EmailFetch => spec(
                DomainRule::host("host"),
                object(
                    &["host"],
                    json!({"host": host, "folder": text, "limit": {"type": "integer", "minimum": 1}, "since": text}),
                ),
                15,
            ),
            ActionType::EmailSend => spec(
                DomainRule::host("host"),
                object(
                    &["host", "to", "subject", "body"],
                    json!({"host": host, "to": recipients, "cc": {"type": "array", "items": text}, "subject": text, "body": text}),
                ),
                120,
            ),
            ActionType::EmailDraft => spec(
                DomainRule::Local,
                object(
                    &["to", "subject", "body"],
                    json!({"to": recipients, "subject": text, "body": text}),
                ),
                90,
            ),
            ActionType::CalendarFetch => spec(
                DomainRule::host("host"),
                object(&["host"], json!({"host": host, "start": text, "end": text})),
                10,
            ),
            ActionType::CalendarCreate => spec(
                DomainRule::host("host"),
                object(
                    &["host", "title", "start", "end"],
                    json!({"host": host, "title": nonempty, "start": nonempty, "end": nonempty, "attendees": {"type": "array", "items": text}}),
                ),
                60,
            ),
            ActionType::CalendarUpdate => spec(
                DomainRule::host("host"),
                object(&["host", "eventId"], json!({"host": host, "eventId": nonempty})),
                45,
            ),
            ActionType::FinanceFetchTransactions => spec(
                DomainRule::fixed("api.plaid.com"),
                object(
                    &["accountId"],
                    json!({"accountId": nonempty, "startDate": text, "endDate": text}),
                ),
                300,
            ),
            ActionType::WebSearch => spec(
                DomainRule::fixed("api.search.brave.com"),
                object(
                    &["query"],
                    json!({"query": nonempty, "count": {"type": "integer", "minimum": 1, "maximum": 50}}),
                ),
                60,
            ),
            ActionType::WebFetch => spec(
                DomainRule::url("url"),
                object(&["url"], json!({"url": nonempty, "method": {"enum": ["GET", "HEAD"]}})),
                30,
            ),
            ActionType::ModelDownload => spec(
                DomainRule::fixed("huggingface.co"),
                object(
                    &["modelId"],
                    json!({"modelId": nonempty, "revision": text, "file": text}),
                ),
                0,
            ),
            ActionType::ServiceApiCall => spec(
                DomainRule::url("url"),
                object(
                    &["url", "method"],
                    json!({"url": nonempty, "method": {"enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]}, "headers": {"type": "object"}}),
                ),
                30,
            ),
            ActionType::ConnectorAuth => spec(
                DomainRule::url("endpoint"),
                object(
                    &["connectorId", "endpoint"],
                    json!({"connectorId": nonempty, "endpoint": nonempty}),
                ),
                0,
            ),
            ActionType::ConnectorSync => spec(
                DomainRule::url("endpoint"),
                object(
                    &["connectorId", "endpoint"],
                    json!({"connectorId": nonempty, "endpoint": nonempty, "cursor": text}),
                ),
                30,
            ),
            ActionType::ReminderCreate => spec(
                DomainRule::Local,
                object(&["text", "dueAt"], json!({"text": nonempty, "dueAt": nonempty})),
                20,
            ),
        };
        specs.insert(action, entry);
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_action() {
        let catalog = ActionCatalog::defaults().unwrap();
        for action in ActionType::ALL {
            assert!(catalog.spec(action).is_some(), "{} missing", action);
        }
    }

    #[test]
    fn url_rule_extracts_host() {
        let catalog = ActionCatalog::defaults().unwrap();
        let domain = catalog
            .target_domain(ActionType::WebFetch, &json!({"url": "https://Evil.COM/path?q=1"}))
            .unwrap();
        assert_eq!(domain.as_deref(), Some("evil.com"));

        assert!(catalog
            .target_domain(ActionType::WebFetch, &json!({"url": "file:///etc/passwd"}))
            .is_err());
        assert!(catalog
            .target_domain(ActionType::WebFetch, &json!({"url": "not a url"}))
            .is_err());
    }

    #[test]
    fn fixed_host_and_local_rules() {
        let catalog = ActionCatalog::defaults().unwrap();
        assert_eq!(
            catalog
                .target_domain(ActionType::ModelDownload, &json!({"modelId": "m"}))
                .unwrap()
                .as_deref(),
            Some("huggingface.co")
        );
        assert_eq!(
            catalog
                .target_domain(ActionType::EmailSend, &json!({"host": "SMTP.mail.example"}))
                .unwrap()
                .as_deref(),
            Some("smtp.mail.example")
        );
        assert_eq!(
            catalog
                .target_domain(ActionType::ReminderCreate, &json!({}))
                .unwrap(),
            None
        );
    }

    #[test]
    fn payload_schema_is_enforced() {
        let catalog = ActionCatalog::defaults().unwrap();
        assert!(catalog
            .validate_payload(ActionType::WebFetch, &json!({"url": "https://example.com"}))
            .is_ok());
        let errors = catalog
            .validate_payload(ActionType::WebFetch, &json!({"method": "DELETE"}))
            .unwrap_err();
        assert!(!errors.is_empty());
        assert!(catalog
            .validate_payload(ActionType::EmailSend, &json!({"host": "h", "to": [], "subject": "", "body": ""}))
            .is_err());
    }

    #[test]
    fn overrides_replace_parts_of_an_entry() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            ActionType::ModelDownload,
            ActionOverride {
                domain_rule: Some(DomainRule::fixed("mirror.example.org")),
                estimated_time_saved_seconds: Some(7),
                ..Default::default()
            },
        );
        let catalog = ActionCatalog::with_overrides(&overrides).unwrap();
        assert_eq!(catalog.time_saved(ActionType::ModelDownload), 7);
        assert_eq!(
            catalog
                .target_domain(ActionType::ModelDownload, &json!({"modelId": "m"}))
                .unwrap()
                .as_deref(),
            Some("mirror.example.org")
        );
        // untouched part keeps its default
        assert!(catalog
            .validate_payload(ActionType::ModelDownload, &json!({}))
            .is_err());
    }

    #[test]
    fn invalid_override_schema_is_reported() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            ActionType::WebSearch,
            ActionOverride {
                payload_schema: Some(json!({"type": 12})),
                ..Default::default()
            },
        );
        assert!(matches!(
            ActionCatalog::with_overrides(&overrides),
            Err(GatewayError::InvalidSchema { action: ActionType::WebSearch, .. })
        ));
    }
}
