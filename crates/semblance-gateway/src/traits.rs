use async_trait::async_trait;

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;

/// One admission check in the validation pipeline.
///
/// Stages run strictly in `stage_number` order and the first rejection ends
/// the pipeline. A stage may enrich the context for the stages after it.
#[async_trait]
pub trait ValidationStage: Send + Sync {
    fn stage_name(&self) -> &'static str;

    fn stage_number(&self) -> u8;

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError>;
}
