use std::sync::Arc;

use async_trait::async_trait;
use semblance_guard::Allowlist;
use semblance_types::ErrorCode;
use tracing::warn;

use crate::context::{StageOutcome, ValidationContext};
use crate::error::GatewayError;
use crate::traits::ValidationStage;

/// Stage 6: Allowlist
///
/// Local-only actions carry no target and pass through.
pub struct AllowlistStage {
    allowlist: Arc<Allowlist>,
}

impl AllowlistStage {
    pub fn new(allowlist: Arc<Allowlist>) -> Self {
        Self { allowlist }
    }
}

#[async_trait]
impl ValidationStage for AllowlistStage {
    fn stage_name(&self) -> &'static str {
        "allowlist"
    }

    fn stage_number(&self) -> u8 {
        6
    }

    async fn evaluate(&self, context: &mut ValidationContext) -> Result<StageOutcome, GatewayError> {
        let Some(domain) = context.target_domain.as_deref() else {
            return Ok(StageOutcome::Pass);
        };
        if self.allowlist.is_allowed(domain) {
            return Ok(StageOutcome::Pass);
        }
        warn!(
            request_id = %context.request_id(),
            domain = %domain,
            "Target domain not on allowlist"
        );
        Ok(StageOutcome::reject(
            ErrorCode::DomainNotAllowed,
            format!("domain {domain} is not on the allowlist"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::decoded;
    use chrono::Utc;
    use semblance_types::ActionType;
    use serde_json::json;

    fn stage() -> AllowlistStage {
        AllowlistStage::new(Arc::new(Allowlist::from_domains(["api.example.com"])))
    }

    #[tokio::test]
    async fn listed_domain_passes() {
        let mut ctx = decoded(ActionType::WebFetch, json!({}), Utc::now());
        ctx.target_domain = Some("api.example.com".into());
        assert!(stage().evaluate(&mut ctx).await.unwrap().is_pass());
    }

    #[tokio::test]
    async fn unlisted_domain_rejected() {
        let mut ctx = decoded(ActionType::WebFetch, json!({}), Utc::now());
        ctx.target_domain = Some("evil.com".into());
        assert!(matches!(
            stage().evaluate(&mut ctx).await.unwrap(),
            StageOutcome::Reject(ref r) if r.code == ErrorCode::DomainNotAllowed
        ));
    }

    #[tokio::test]
    async fn local_action_skips_check() {
        let mut ctx = decoded(ActionType::EmailDraft, json!({}), Utc::now());
        assert!(stage().evaluate(&mut ctx).await.unwrap().is_pass());
    }
}
