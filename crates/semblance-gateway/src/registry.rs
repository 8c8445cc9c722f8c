//! Seam to the service adapters that perform the actual network work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use semblance_types::ActionType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// What an adapter reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdapterOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    Failed(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Performs one kind of outbound work once the pipeline admits it.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    async fn execute(
        &self,
        action: ActionType,
        payload: &Value,
    ) -> Result<AdapterOutcome, AdapterError>;
}

/// Looks up the adapter responsible for an action type.
pub trait ServiceRegistry: Send + Sync {
    fn adapter(&self, action: ActionType) -> Option<Arc<dyn ServiceAdapter>>;
}

/// Map-backed registry.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<ActionType, Arc<dyn ServiceAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` for `action`, replacing any previous one.
    pub fn register(&self, action: ActionType, adapter: Arc<dyn ServiceAdapter>) {
        self.adapters.write().insert(action, adapter);
    }

    /// Register one adapter for every action of a family, e.g. `"email"`.
    pub fn register_family(&self, family: &str, adapter: Arc<dyn ServiceAdapter>) -> usize {
        let mut adapters = self.adapters.write();
        let mut count = 0;
        for action in ActionType::ALL.into_iter().filter(|a| a.family() == family) {
            adapters.insert(action, adapter.clone());
            count += 1;
        }
        count
    }

    pub fn registered(&self) -> Vec<ActionType> {
        let mut actions: Vec<ActionType> = self.adapters.read().keys().copied().collect();
        actions.sort();
        actions
    }
}

impl ServiceRegistry for AdapterRegistry {
    fn adapter(&self, action: ActionType) -> Option<Arc<dyn ServiceAdapter>> {
        self.adapters.read().get(&action).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockAdapter;

    #[test]
    fn lookup_by_action_and_family() {
        let registry = AdapterRegistry::new();
        registry.register(ActionType::WebFetch, Arc::new(MockAdapter::succeeding(Value::Null)));
        assert!(registry.adapter(ActionType::WebFetch).is_some());
        assert!(registry.adapter(ActionType::EmailSend).is_none());

        let n = registry.register_family("email", Arc::new(MockAdapter::succeeding(Value::Null)));
        assert_eq!(n, 3);
        assert!(registry.adapter(ActionType::EmailDraft).is_some());
        assert_eq!(registry.registered().len(), 4);
    }

    #[test]
    fn outcome_serializes_sparsely() {
        let v = serde_json::to_value(AdapterOutcome::failed("boom")).unwrap();
        assert_eq!(v, serde_json::json!({"success": false, "error": "boom"}));
    }
}
