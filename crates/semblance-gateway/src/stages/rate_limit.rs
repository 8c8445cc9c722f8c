use std::sync::Arc;

use async_trait::async_trait;
use semblance_guard::RateLimitStore;
use semblance_types::ErrorCode;
use tracing::debug;

use crate::context::{Rejection, StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 7: Rate limit
///
/// Only checks the window. The hit is recorded by the gateway once the
/// request is committed to execution, so rejected requests never consume
/// budget.
pub struct RateLimitStage {
    limiter: Arc<dyn RateLimitStore>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<dyn RateLimitStore>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl ValidationStage for RateLimitStage {
    fn stage_name(&self) -> &'static str {
        "rate_limit"
    }

    fn stage_number(&self) -> u8 {
        7
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let action = context.request(self.stage_name())?.action;
        let decision = self.limiter.check(action, context.received_at).await;
        if decision.allowed {
            return Ok(StageOutcome::Pass);
        }
        let retry_after_ms = decision.retry_after_ms.unwrap_or(1);
        debug!(action = %action, retry_after_ms, "Rate limit reached");
        Ok(StageOutcome::Reject(
            Rejection::new(
                ErrorCode::RateLimited,
                format!("rate limit for {action} exceeded"),
            )
            .with_retry_after(retry_after_ms),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::decoded;
    use chrono::Utc;
    use semblance_guard::{RateLimitConfig, RateQuota, SlidingWindowLimiter};
    use semblance_types::ActionType;
    use serde_json::json;

    #[tokio::test]
    async fn full_window_rejects_with_retry_hint() {
        let config = RateLimitConfig::default()
            .with_quota(ActionType::WebSearch, RateQuota::new(1, 60_000));
        let limiter = Arc::new(SlidingWindowLimiter::new(config));
        let stage = RateLimitStage::new(limiter.clone());
        let now = Utc::now();

        let mut ctx = decoded(ActionType::WebSearch, json!({"query": "q"}), now);
        assert!(stage.evaluate(&mut ctx).await.unwrap().is_pass());
        // checking alone never consumes budget
        assert!(stage.evaluate(&mut ctx).await.unwrap().is_pass());

        limiter.record(ActionType::WebSearch, now).await;
        match stage.evaluate(&mut ctx).await.unwrap() {
            StageOutcome::Reject(r) => {
                assert_eq!(r.code, ErrorCode::RateLimited);
                assert_eq!(r.retry_after_ms, Some(60_000));
            }
            StageOutcome::Pass => panic!("expected rate limit"),
        }
    }
}
