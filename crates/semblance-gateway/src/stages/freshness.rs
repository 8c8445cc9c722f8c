use std::sync::Arc;

use async_trait::async_trait;
use semblance_guard::ReplayGuard;
use semblance_types::ErrorCode;

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 2: Freshness
///
/// Rejects timestamps outside the TTL in either direction, before the
/// signature is even looked at.
pub struct FreshnessStage {
    guard: Arc<ReplayGuard>,
}

impl FreshnessStage {
    pub fn new(guard: Arc<ReplayGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl ValidationStage for FreshnessStage {
    fn stage_name(&self) -> &'static str {
        "freshness"
    }

    fn stage_number(&self) -> u8 {
        2
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let timestamp = context
            .timestamp
            .ok_or(GatewayError::EnvelopeMissing(self.stage_name()))?;
        match self.guard.check_freshness(timestamp, context.received_at) {
            Ok(()) => Ok(StageOutcome::Pass),
            Err(e) => Ok(StageOutcome::reject(ErrorCode::TimestampStale, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::decoded;
    use chrono::{Duration, Utc};
    use semblance_types::ActionType;
    use serde_json::json;

    #[tokio::test]
    async fn stale_and_future_are_both_rejected() {
        let stage = FreshnessStage::new(Arc::new(ReplayGuard::in_memory(10, 30_000)));
        let now = Utc::now();

        for skew in [Duration::seconds(-45), Duration::seconds(45)] {
            let mut ctx = decoded(ActionType::WebSearch, json!({"query": "q"}), now);
            ctx.timestamp = Some(now + skew);
            let result = stage.evaluate(&mut ctx).await.unwrap();
            assert!(matches!(
                result,
                StageOutcome::Reject(ref r) if r.code == ErrorCode::TimestampStale
            ));
        }

        let mut ctx = decoded(ActionType::WebSearch, json!({"query": "q"}), now);
        ctx.timestamp = Some(now - Duration::seconds(10));
        assert!(stage.evaluate(&mut ctx).await.unwrap().is_pass());
    }
}
