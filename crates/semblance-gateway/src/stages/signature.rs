use async_trait::async_trait;
use semblance_crypto::{verify_request, SigningKey};
use semblance_types::ErrorCode;
use tracing::warn;

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 5: Signature
///
/// HMAC-SHA256 over id, timestamp, action and canonical payload. Runs after
/// the cheap structural checks so forged envelopes cost as little as possible.
pub struct SignatureStage {
    key: SigningKey,
}

impl SignatureStage {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl ValidationStage for SignatureStage {
    fn stage_name(&self) -> &'static str {
        "signature"
    }

    fn stage_number(&self) -> u8 {
        5
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let request = context.request(self.stage_name())?;
        if verify_request(&self.key, request) {
            return Ok(StageOutcome::Pass);
        }
        warn!(
            request_id = %request.id,
            action = %request.action,
            "Envelope signature mismatch"
        );
        Ok(StageOutcome::reject(
            ErrorCode::SignatureInvalid,
            "signature does not match envelope",
        ))
    }
}
