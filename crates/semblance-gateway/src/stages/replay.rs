use std::sync::Arc;

use async_trait::async_trait;
use semblance_guard::{ReplayGuard, ReplayVerdict};
use semblance_types::ErrorCode;

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 3: Replay
///
/// Records the id at check time, so a duplicate arriving while the original
/// is still in flight is already caught. The record is kept for as long as
/// the envelope's own timestamp would pass the freshness stage.
pub struct ReplayStage {
    guard: Arc<ReplayGuard>,
}

impl ReplayStage {
    pub fn new(guard: Arc<ReplayGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl ValidationStage for ReplayStage {
    fn stage_name(&self) -> &'static str {
        "replay"
    }

    fn stage_number(&self) -> u8 {
        3
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let request = context.request(self.stage_name())?;
        let timestamp = context
            .timestamp
            .ok_or(GatewayError::EnvelopeMissing(self.stage_name()))?;
        match self.guard.check(&request.id, timestamp, context.received_at).await {
            ReplayVerdict::Fresh => Ok(StageOutcome::Pass),
            ReplayVerdict::Replayed { first_seen } => Ok(StageOutcome::reject(
                ErrorCode::RequestReplayed,
                format!(
                    "request id already seen at {}",
                    first_seen.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
                ),
            )),
        }
    }
}
