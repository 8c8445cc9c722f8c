//! Per-action rate limiting over a rolling window.
//!
//! `check` is read-only. Budget is consumed by `record`, which the pipeline
//! calls only once a request has cleared every admission gate, so a request
//! later escalated by anomaly detection costs nothing.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use semblance_types::ActionType;
use serde::{Deserialize, Serialize};

/// Fixed quota for one action type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuota {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateQuota {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms as i64)
    }
}

impl Default for RateQuota {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Applies to every action without an override.
    pub default: RateQuota,
    pub per_action: BTreeMap<ActionType, RateQuota>,
}

impl RateLimitConfig {
    pub fn quota_for(&self, action: ActionType) -> RateQuota {
        self.per_action.get(&action).copied().unwrap_or(self.default)
    }

    pub fn with_quota(mut self, action: ActionType, quota: RateQuota) -> Self {
        self.per_action.insert(action, quota);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    /// Milliseconds until the oldest counted request leaves the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
        }
    }

    pub fn deny(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms: Some(retry_after_ms.max(1)),
        }
    }
}

/// Rate-limit counters, injected into the pipeline.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn check(&self, action: ActionType, now: DateTime<Utc>) -> RateDecision;

    async fn record(&self, action: ActionType, now: DateTime<Utc>);
}

/// In-memory sliding-window limiter keyed by action type.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    history: Mutex<HashMap<ActionType, VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Requests counted against `action` in the window ending at `now`.
    pub fn in_window(&self, action: ActionType, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.quota_for(action).window();
        self.history
            .lock()
            .get(&action)
            .map(|h| h.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RateLimitStore for SlidingWindowLimiter {
    async fn check(&self, action: ActionType, now: DateTime<Utc>) -> RateDecision {
        let quota = self.config.quota_for(action);
        if quota.max_requests == 0 {
            return RateDecision::deny(quota.window_ms);
        }
        let window = quota.window();
        let cutoff = now - window;

        let mut history = self.history.lock();
        let Some(entries) = history.get_mut(&action) else {
            return RateDecision::allow();
        };
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
        if entries.len() < quota.max_requests as usize {
            return RateDecision::allow();
        }
        // The window frees up when the oldest counted request ages out.
        let oldest = entries.front().copied().unwrap_or(now);
        let retry_after = (oldest + window - now).num_milliseconds().max(1) as u64;
        RateDecision::deny(retry_after)
    }

    async fn record(&self, action: ActionType, now: DateTime<Utc>) {
        let quota = self.config.quota_for(action);
        let cutoff = now - quota.window();
        let mut history = self.history.lock();
        let entries = history.entry(action).or_default();
        entries.push_back(now);
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
        // Nothing beyond the quota can influence a decision.
        while entries.len() > quota.max_requests.max(1) as usize {
            entries.pop_front();
        }
    }
}
