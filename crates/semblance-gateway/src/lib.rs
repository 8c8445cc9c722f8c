//! Semblance Gateway: the validation pipeline every outbound action crosses.
//!
//! The core never touches the network. It hands the gateway a signed
//! [`ActionRequest`](semblance_types::ActionRequest) and the gateway decides,
//! records and (only if everything checks out) delegates to a service adapter.
//!
//! ## Guarantees
//!
//! - **Record before effect**: a `pending` audit entry is durable before any
//!   adapter is called. If it cannot be written the action is refused with
//!   `AUDIT_UNAVAILABLE`.
//! - **Exactly one outcome**: every submission produces one response. A
//!   rejection writes one audit entry, an execution writes two.
//! - **Replay closed at check time**: request ids are recorded when first
//!   seen, not after execution.
//! - **Budget only for admitted work**: the rate limiter records a hit only
//!   once a request is committed to execution.
//! - **Adapters cannot escape**: errors and panics become `EXECUTION_ERROR`.
//!
//! ## Pipeline
//!
//! 1. **Envelope**: structural validation
//! 2. **Freshness**: timestamp within the TTL in either direction
//! 3. **Replay**: request id not seen while its envelope is still fresh
//! 4. **Payload**: per-action schema, target domain derivation
//! 5. **Signature**: HMAC over the full envelope
//! 6. **Allowlist**: target domain authorized
//! 7. **Rate limit**: per-action window
//! 8. **Anomaly**: bursts escalate to `requires_approval`
//! 9. **Pending entry** appended
//! 10. **Execution** through the [`ServiceRegistry`]
//! 11. **Resolving entry** appended
//! 12. **Response** referencing the resolving entry

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod mocks;
pub mod network;
pub mod registry;
pub mod stages;
pub mod traits;

pub use catalog::{ActionCatalog, ActionOverride, ActionSpec, DomainRule};
pub use config::GatewayConfig;
pub use context::{Rejection, StageOutcome, ValidationContext};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder, PrivacyStatus};
pub use mocks::MockAdapter;
pub use network::{
    ActiveConnection, AllowlistEntry, ConnectionRecord, Granularity, HostStatistics,
    NetworkMonitor, NetworkStatistics, Period, TimelineBucket, UnauthorizedAttempt,
};
pub use registry::{AdapterError, AdapterOutcome, AdapterRegistry, ServiceAdapter, ServiceRegistry};
pub use stages::{
    AllowlistStage, AnomalyStage, EnvelopeStage, FreshnessStage, PayloadStage, RateLimitStage,
    ReplayStage, SignatureStage,
};
pub use traits::ValidationStage;
