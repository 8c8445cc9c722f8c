use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use semblance_types::ActionType;
use serde_json::Value;

use crate::registry::{AdapterError, AdapterOutcome, ServiceAdapter};

#[derive(Debug, Clone)]
enum MockBehavior {
    Succeed(Value),
    Fail(String),
    Error(String),
    Panic(String),
}

/// Scriptable adapter for tests. Counts every call it receives.
pub struct MockAdapter {
    behavior: MockBehavior,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockAdapter {
    fn with(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(data: Value) -> Self {
        Self::with(MockBehavior::Succeed(data))
    }

    /// Reports `success: false`.
    pub fn failing(error: impl Into<String>) -> Self {
        Self::with(MockBehavior::Fail(error.into()))
    }

    /// Returns an `AdapterError`.
    pub fn erroring(error: impl Into<String>) -> Self {
        Self::with(MockBehavior::Error(error.into()))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with(MockBehavior::Panic(message.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceAdapter for MockAdapter {
    async fn execute(
        &self,
        _action: ActionType,
        _payload: &Value,
    ) -> Result<AdapterOutcome, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.behavior {
            MockBehavior::Succeed(data) => Ok(AdapterOutcome::ok(data.clone())),
            MockBehavior::Fail(error) => Ok(AdapterOutcome::failed(error.clone())),
            MockBehavior::Error(error) => Err(AdapterError::Failed(error.clone())),
            MockBehavior::Panic(message) => panic!("{}", message),
        }
    }
}
