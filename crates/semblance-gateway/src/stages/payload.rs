use std::sync::Arc;

use async_trait::async_trait;
use semblance_types::ErrorCode;

use crate::catalog::ActionCatalog;
use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 4: Payload schema
///
/// Validates the payload against the action's catalog schema and derives
/// the target domain for the allowlist stage. A payload whose domain rule
/// cannot be applied is invalid.
pub struct PayloadStage {
    catalog: Arc<ActionCatalog>,
}

impl PayloadStage {
    pub fn new(catalog: Arc<ActionCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ValidationStage for PayloadStage {
    fn stage_name(&self) -> &'static str {
        "payload"
    }

    fn stage_number(&self) -> u8 {
        4
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let request = context.request(self.stage_name())?;
        if let Err(errors) = self.catalog.validate_payload(request.action, &request.payload) {
            return Ok(StageOutcome::reject(ErrorCode::PayloadInvalid, errors.join("; ")));
        }
        match self.catalog.target_domain(request.action, &request.payload) {
            Ok(domain) => {
                context.target_domain = domain;
                Ok(StageOutcome::Pass)
            }
            Err(reason) => Ok(StageOutcome::reject(ErrorCode::PayloadInvalid, reason)),
        }
    }
}
