use std::sync::Arc;

use async_trait::async_trait;
use semblance_guard::{AnomalyDetector, AnomalyInput};
use semblance_types::ErrorCode;
use tracing::{info, warn};

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 8: Anomaly
///
/// Every finding is kept on the context for the audit record. Only blocking
/// findings escalate to `requires_approval`.
pub struct AnomalyStage {
    detector: Arc<AnomalyDetector>,
}

impl AnomalyStage {
    pub fn new(detector: Arc<AnomalyDetector>) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl ValidationStage for AnomalyStage {
    fn stage_name(&self) -> &'static str {
        "anomaly"
    }

    fn stage_number(&self) -> u8 {
        8
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let request = context.request(self.stage_name())?;
        let input = AnomalyInput {
            action: request.action,
            payload: &request.payload,
            target_domain: context.target_domain.as_deref(),
        };
        let report = self.detector.check(input, context.received_at);
        if !report.flagged {
            return Ok(StageOutcome::Pass);
        }

        let request_id = request.id.clone();
        let blocking = report.is_blocking();
        let summary = report
            .anomalies
            .iter()
            .map(|a| a.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        context.anomalies = report.anomalies;

        if blocking {
            warn!(request_id = %request_id, anomalies = %summary, "Escalating for approval");
            return Ok(StageOutcome::reject(ErrorCode::AnomalyDetected, summary));
        }
        info!(request_id = %request_id, anomalies = %summary, "Anomaly noted");
        Ok(StageOutcome::Pass)
    }
}
