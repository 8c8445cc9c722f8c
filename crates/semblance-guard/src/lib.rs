//! # semblance-guard
//!
//! Admission controls consulted by the gateway pipeline before any action is
//! allowed to reach the network.
//!
//! - **Allowlist**: hostnames the gateway may contact on the user's behalf
//! - **ReplayGuard**: timestamp freshness plus a bounded, TTL-purged set of
//!   recently seen request ids
//! - **SlidingWindowLimiter**: per-action quota over a rolling window
//! - **AnomalyDetector**: heuristic findings; only `burst` blocks
//!
//! Shared state sits behind the [`ReplayStore`] and [`RateLimitStore`] traits
//! and is injected into the pipeline, so in-memory stores can be replaced by
//! persistent or distributed ones without touching the stages.

pub mod allowlist;
pub mod anomaly;
pub mod error;
pub mod rate;
pub mod replay;

pub use allowlist::Allowlist;
pub use anomaly::{
    AnomalyConfig, AnomalyDetector, AnomalyFinding, AnomalyInput, AnomalyKind, AnomalyReport,
    AnomalySeverity,
};
pub use error::GuardError;
pub use rate::{RateDecision, RateLimitConfig, RateLimitStore, RateQuota, SlidingWindowLimiter};
pub use replay::{
    spawn_sweeper, MemoryReplayStore, ReplayGuard, ReplayStore, ReplayVerdict, SweepHandle,
};
