use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use futures::FutureExt;
use semblance_audit::{ActionLogEntry, AuditEntry, AuditRecord, AuditStatus, AuditTrail};
use semblance_crypto::SigningKey;
use semblance_guard::{
    spawn_sweeper, Allowlist, AnomalyDetector, MemoryReplayStore, RateLimitStore, ReplayGuard,
    ReplayStore, SlidingWindowLimiter, SweepHandle,
};
use semblance_types::{ActionRequest, ActionResponse, ActionType, ErrorCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalog::ActionCatalog;
use crate::config::GatewayConfig;
use crate::context::{Rejection, StageOutcome, ValidationContext};
use crate::error::{GatewayError, Result};
use crate::network::{
    ActiveConnection, AllowlistEntry, ConnectionRecord, Granularity, NetworkMonitor,
    NetworkStatistics, Period, TimelineBucket, UnauthorizedAttempt,
};
use crate::registry::{AdapterOutcome, AdapterRegistry, ServiceAdapter, ServiceRegistry};
use crate::stages::{
    AllowlistStage, AnomalyStage, EnvelopeStage, FreshnessStage, PayloadStage, RateLimitStage,
    ReplayStage, SignatureStage,
};
use crate::traits::ValidationStage;

/// Attribution for a rate rejection raised at admission time.
const RATE_LIMIT_STAGE: (&str, u8) = ("rate_limit", 7);

/// Privacy summary derived from the audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyStatus {
    /// No action has ever reached a remote host.
    pub all_local: bool,
    /// Distinct remote hosts successfully contacted.
    pub connection_count: usize,
    /// Timestamp of the newest audit entry.
    pub last_audit_entry: Option<String>,
    /// Any anomaly noted or escalated within the last 24 hours.
    pub anomaly_detected: bool,
}

/// The validation pipeline.
///
/// Every outbound action passes through [`Gateway::process`]: eight ordered
/// validation stages, a pending audit entry, adapter execution and a
/// resolving audit entry. The first failing stage short-circuits and is
/// recorded as a single rejection entry. No path returns without a
/// durable record, except when the trail itself refuses the write.
pub struct Gateway {
    stages: Vec<Box<dyn ValidationStage>>,
    audit: Arc<AuditTrail>,
    registry: Arc<dyn ServiceRegistry>,
    rate_limiter: Arc<dyn RateLimitStore>,
    replay: Arc<ReplayGuard>,
    allowlist: Arc<Allowlist>,
    catalog: Arc<ActionCatalog>,
    network: NetworkMonitor,
    /// Serializes the final rate check with the hit it records.
    admission: Mutex<()>,
    config: GatewayConfig,
    _sweeper: Option<SweepHandle>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig, key: SigningKey) -> GatewayBuilder {
        GatewayBuilder::new(config, key)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.allowlist
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub fn replay_guard(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    /// Submit a typed request.
    pub async fn submit(&self, request: &ActionRequest) -> ActionResponse {
        let raw = serde_json::to_value(request).unwrap_or(Value::Null);
        self.process(raw).await
    }

    /// Run one raw envelope through the pipeline. Never fails: every outcome
    /// is an [`ActionResponse`].
    pub async fn process(&self, raw: Value) -> ActionResponse {
        let mut context = ValidationContext::new(raw, Utc::now());

        for stage in &self.stages {
            debug!(
                stage = stage.stage_name(),
                number = stage.stage_number(),
                "Evaluating stage"
            );
            let outcome = match stage.evaluate(&mut context).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stage = stage.stage_name(), error = %e, "Stage failed internally");
                    StageOutcome::reject(ErrorCode::SchemaInvalid, e.to_string())
                }
            };
            if let StageOutcome::Reject(rejection) = outcome {
                return self
                    .reject(&context, stage.stage_name(), stage.stage_number(), rejection)
                    .await;
            }
        }

        let Some(request) = context.request.clone() else {
            // Unreachable with the envelope stage installed.
            return self
                .reject(
                    &context,
                    "envelope",
                    1,
                    Rejection::new(ErrorCode::SchemaInvalid, "envelope not decoded"),
                )
                .await;
        };
        self.execute(&context, request).await
    }

    /// Record a rejection and build its response.
    async fn reject(
        &self,
        context: &ValidationContext,
        stage: &'static str,
        stage_number: u8,
        rejection: Rejection,
    ) -> ActionResponse {
        let request_id = context.request_id();
        let code = rejection.code;

        if code.is_security_relevant() {
            warn!(
                request_id = %request_id,
                stage,
                code = %code,
                message = %rejection.message,
                "Security-relevant rejection"
            );
        } else {
            info!(
                request_id = %request_id,
                stage,
                code = %code,
                message = %rejection.message,
                "Action rejected"
            );
        }

        let mut record = AuditRecord::request(
            request_id.clone(),
            context.action_name(),
            AuditStatus::from(code.status()),
        )
        .payload(context.payload())
        .signature(context.signature())
        .metadata("rejectionReason", code.rejection_reason())
        .metadata("errorCode", code.as_str())
        .metadata("message", &rejection.message)
        .metadata("stage", stage)
        .metadata("stageNumber", stage_number);
        if !context.anomalies.is_empty() {
            record = record.metadata("anomalies", &context.anomalies);
        }
        if let Some(domain) = &context.target_domain {
            record = record.metadata("targetDomain", domain);
        }
        if let Some(retry) = rejection.retry_after_ms {
            record = record.metadata("retryAfterMs", retry);
        }
        if let Some(timestamp) = context.timestamp {
            record = record.metadata("requestTimestamp", rfc3339(timestamp));
        }

        let response = match self.append_audited(record).await {
            Ok(entry) => ActionResponse::failure(&request_id, code, rejection.message, entry.id),
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Could not record rejection");
                return ActionResponse::failure(
                    &request_id,
                    ErrorCode::AuditUnavailable,
                    "audit trail unavailable",
                    "",
                );
            }
        };
        match rejection.retry_after_ms {
            Some(retry) => response.with_retry_after(retry),
            None => response,
        }
    }

    /// Steps 9 to 12: pending entry, execution, resolving entry, response.
    async fn execute(&self, context: &ValidationContext, request: ActionRequest) -> ActionResponse {
        let action = request.action;

        let pending = {
            let admission = self.admission.lock().await;

            // Concurrent requests may have filled the window since stage 7.
            let decision = self.rate_limiter.check(action, Utc::now()).await;
            if !decision.allowed {
                let retry = decision.retry_after_ms.unwrap_or(1);
                drop(admission);
                let (stage, number) = RATE_LIMIT_STAGE;
                return self
                    .reject(
                        context,
                        stage,
                        number,
                        Rejection::new(
                            ErrorCode::RateLimited,
                            format!("rate limit for {action} exceeded"),
                        )
                        .with_retry_after(retry),
                    )
                    .await;
            }

            let mut record = AuditRecord::request(&request.id, action.as_str(), AuditStatus::Pending)
                .payload(&request.payload)
                .signature(&request.signature);
            if let Some(timestamp) = context.timestamp {
                record = record.metadata("requestTimestamp", rfc3339(timestamp));
            }
            if let Some(domain) = &context.target_domain {
                record = record.metadata("targetDomain", domain);
            }
            if !context.anomalies.is_empty() {
                record = record.metadata("anomalies", &context.anomalies);
            }
            let pending = match self.append_audited(record).await {
                Ok(entry) => entry,
                Err(e) => {
                    error!(
                        request_id = %request.id,
                        error = %e,
                        "Could not record pending entry, refusing to execute"
                    );
                    return ActionResponse::failure(
                        &request.id,
                        ErrorCode::AuditUnavailable,
                        "audit trail unavailable",
                        "",
                    );
                }
            };
            self.rate_limiter.record(action, Utc::now()).await;
            pending
        };

        info!(
            request_id = %request.id,
            action = %action,
            payload_hash = %pending.payload_hash,
            audit_id = %pending.id,
            "Action admitted"
        );

        let result = self.run_adapter(action, &request.payload).await;

        let mut record = AuditRecord::response(&request.id, action.as_str(), AuditStatus::Success)
            .metadata("pendingRef", &pending.id);
        if let Some(domain) = &context.target_domain {
            record = record.metadata("targetDomain", domain);
        }
        let (data, failure) = match result {
            Ok(data) => {
                record = record
                    .payload(data.as_ref().unwrap_or(&Value::Null))
                    .time_saved(self.catalog.time_saved(action));
                (data, None)
            }
            Err(message) => {
                record = AuditRecord::response(&request.id, action.as_str(), AuditStatus::Error)
                    .metadata("pendingRef", &pending.id)
                    .metadata("errorCode", ErrorCode::ExecutionError.as_str())
                    .metadata("message", &message);
                if let Some(domain) = &context.target_domain {
                    record = record.metadata("targetDomain", domain);
                }
                (None, Some(message))
            }
        };

        let audit_ref = match self.append_audited(record).await {
            Ok(entry) => entry.id,
            Err(e) => {
                error!(
                    request_id = %request.id,
                    pending_ref = %pending.id,
                    error = %e,
                    "Could not record execution outcome"
                );
                pending.id.clone()
            }
        };

        match failure {
            None => ActionResponse::success(&request.id, data, audit_ref),
            Some(message) => {
                warn!(request_id = %request.id, action = %action, message = %message, "Execution failed");
                ActionResponse::failure(&request.id, ErrorCode::ExecutionError, message, audit_ref)
            }
        }
    }

    /// Call the adapter outside every lock. Errors, panics and
    /// `success: false` all come back as a message.
    async fn run_adapter(
        &self,
        action: ActionType,
        payload: &Value,
    ) -> std::result::Result<Option<Value>, String> {
        let Some(adapter) = self.registry.adapter(action) else {
            return Err(format!("no adapter registered for {action}"));
        };
        match AssertUnwindSafe(adapter.execute(action, payload)).catch_unwind().await {
            Ok(Ok(AdapterOutcome { success: true, data, .. })) => Ok(data),
            Ok(Ok(AdapterOutcome { error, .. })) => {
                Err(error.unwrap_or_else(|| "adapter reported failure".to_string()))
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(format!("adapter panicked: {detail}"))
            }
        }
    }

    /// Newest-first page of completed actions.
    pub fn action_log(&self, limit: usize, offset: usize) -> Vec<ActionLogEntry> {
        self.audit.action_log(limit, offset)
    }

    /// Seconds saved by successful actions in `[from, to)`.
    pub fn time_saved(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        self.audit.time_saved(from, to)
    }

    pub fn privacy_status(&self) -> PrivacyStatus {
        let hosts = self.network.contacted_hosts();
        PrivacyStatus {
            all_local: hosts == 0,
            connection_count: hosts,
            last_audit_entry: self.audit.head().map(|e| rfc3339(e.timestamp)),
            anomaly_detected: self.network.anomaly_since(Utc::now() - Duration::hours(24)),
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Allowlisted domains with their contact totals.
    pub fn network_allowlist(&self) -> Vec<AllowlistEntry> {
        self.network.allowlist(&self.allowlist.domains())
    }

    pub fn active_connections(&self) -> Vec<ActiveConnection> {
        self.network.active_connections()
    }

    /// `domain_not_allowed` rejections, newest first.
    pub fn unauthorized_attempts(&self, period: Period) -> Vec<UnauthorizedAttempt> {
        self.network.unauthorized_attempts(period.since(Utc::now()))
    }

    pub fn connection_history(&self, limit: usize) -> Vec<ConnectionRecord> {
        self.network.history(limit)
    }

    pub fn network_statistics(&self, period: Period) -> NetworkStatistics {
        self.network.statistics(period, Utc::now())
    }

    pub fn connection_timeline(
        &self,
        period: Period,
        granularity: Granularity,
    ) -> Vec<TimelineBucket> {
        self.network.timeline(period, granularity, Utc::now())
    }

    /// Append to the trail and fold the sealed entry into the network view.
    async fn append_audited(&self, record: AuditRecord) -> semblance_audit::Result<AuditEntry> {
        let entry = self.audit.append(record).await?;
        self.network.observe(&entry);
        Ok(entry)
    }
}

/// Assembles a [`Gateway`]. Stores not supplied explicitly fall back to the
/// in-memory implementations sized from the configuration.
pub struct GatewayBuilder {
    config: GatewayConfig,
    key: SigningKey,
    audit: Option<Arc<AuditTrail>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    adapters: AdapterRegistry,
    replay_store: Option<Arc<dyn ReplayStore>>,
    rate_limiter: Option<Arc<dyn RateLimitStore>>,
    allowlist: Option<Arc<Allowlist>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig, key: SigningKey) -> Self {
        Self {
            config,
            key,
            audit: None,
            registry: None,
            adapters: AdapterRegistry::new(),
            replay_store: None,
            rate_limiter: None,
            allowlist: None,
        }
    }

    pub fn audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use an external registry. Mutually exclusive with [`Self::adapter`].
    pub fn registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn adapter(self, action: ActionType, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapters.register(action, adapter);
        self
    }

    pub fn replay_store(mut self, store: Arc<dyn ReplayStore>) -> Self {
        self.replay_store = Some(store);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Share an allowlist with the connector setup flow. Configured entries
    /// are added to it.
    pub fn allowlist(mut self, allowlist: Arc<Allowlist>) -> Self {
        self.allowlist = Some(allowlist);
        self
    }

    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;
        let catalog = Arc::new(ActionCatalog::with_overrides(&config.actions)?);

        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(AuditTrail::in_memory().await?),
        };

        let registry: Arc<dyn ServiceRegistry> = match self.registry {
            Some(_) if !self.adapters.registered().is_empty() => {
                return Err(GatewayError::Config(
                    "adapters cannot be registered alongside an external registry".into(),
                ));
            }
            Some(registry) => registry,
            None => Arc::new(self.adapters),
        };

        let allowlist = match self.allowlist {
            Some(allowlist) => {
                for domain in &config.allowlist {
                    if let Err(e) = allowlist.add(domain) {
                        warn!(domain = %domain, error = %e, "Ignoring invalid allowlist entry");
                    }
                }
                allowlist
            }
            None => Arc::new(Allowlist::from_domains(&config.allowlist)),
        };

        let replay_store = self.replay_store.unwrap_or_else(|| {
            Arc::new(MemoryReplayStore::new(
                config.replay_capacity,
                Duration::milliseconds(config.freshness_ttl_ms as i64),
            ))
        });
        let replay = Arc::new(ReplayGuard::new(replay_store, config.freshness_ttl_ms));

        if config.rebuild_replay_from_audit {
            let now = Utc::now();
            // A future-dated envelope keeps its id for up to two TTLs after
            // it was first seen.
            let ids = audit.recent_requests(now - replay.ttl() * 2, replay_record);
            let seeded = replay.seed(ids, now).await;
            if seeded > 0 {
                info!(seeded, "Replay set rebuilt from audit trail");
            }
        }

        let sweeper = (config.replay_sweep_interval_ms > 0).then(|| {
            spawn_sweeper(
                &replay,
                std::time::Duration::from_millis(config.replay_sweep_interval_ms),
            )
        });

        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| Arc::new(SlidingWindowLimiter::new(config.rate_limits.clone())));
        let detector = Arc::new(AnomalyDetector::new(config.anomaly.clone()));

        let stages: Vec<Box<dyn ValidationStage>> = vec![
            Box::new(EnvelopeStage),
            Box::new(FreshnessStage::new(replay.clone())),
            Box::new(ReplayStage::new(replay.clone())),
            Box::new(PayloadStage::new(catalog.clone())),
            Box::new(SignatureStage::new(self.key)),
            Box::new(AllowlistStage::new(allowlist.clone())),
            Box::new(RateLimitStage::new(rate_limiter.clone())),
            Box::new(AnomalyStage::new(detector)),
        ];

        let network = NetworkMonitor::new(config.network_history_capacity);
        audit.for_each(|entry| network.observe(entry));
        // Pending entries left unresolved by a previous run are not in flight.
        network.clear_active();

        info!(
            audit = %audit.store_description(),
            allowlisted = allowlist.len(),
            ttl_ms = config.freshness_ttl_ms,
            "Gateway ready"
        );

        Ok(Gateway {
            stages,
            audit,
            registry,
            rate_limiter,
            replay,
            allowlist,
            catalog,
            network,
            admission: Mutex::new(()),
            config,
            _sweeper: sweeper,
        })
    }
}

/// `(id, first_seen, request_timestamp)` for requests whose id the replay
/// stage recorded: admitted ones, and those rejected by a later stage.
fn replay_record(entry: &AuditEntry) -> Option<(String, DateTime<Utc>, DateTime<Utc>)> {
    let recorded = entry.status == AuditStatus::Pending
        || entry
            .metadata
            .get("stageNumber")
            .and_then(Value::as_u64)
            .is_some_and(|n| n > 3);
    if !recorded {
        return None;
    }
    let request_timestamp = entry
        .metadata_str("requestTimestamp")
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or(entry.timestamp, |ts| ts.with_timezone(&Utc));
    Some((entry.request_id.clone(), entry.timestamp, request_timestamp))
}

fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}
