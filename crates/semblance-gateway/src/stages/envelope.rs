use async_trait::async_trait;
use semblance_types::{ActionRequest, ErrorCode};

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 1: Envelope schema
///
/// Decodes the raw envelope and checks its structure. Unknown actions,
/// unknown fields and unparseable timestamps all end here.
pub struct EnvelopeStage;

#[async_trait]
impl ValidationStage for EnvelopeStage {
    fn stage_name(&self) -> &'static str {
        "envelope"
    }

    fn stage_number(&self) -> u8 {
        1
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let request = match ActionRequest::from_value(&context.raw) {
            Ok(r) => r,
            Err(e) => return Ok(StageOutcome::reject(ErrorCode::SchemaInvalid, e.to_string())),
        };
        match request.parsed_timestamp() {
            Ok(ts) => context.timestamp = Some(ts),
            Err(e) => return Ok(StageOutcome::reject(ErrorCode::SchemaInvalid, e.to_string())),
        }
        context.request = Some(request);
        Ok(StageOutcome::Pass)
    }
}
