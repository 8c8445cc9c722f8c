//! Network monitor: the view of outbound traffic the core shows the user.
//!
//! Fed from every audit entry the gateway writes (and replayed from the
//! trail on startup), so queries never rescan the ledger. Connection and
//! attempt history are bounded; per-host totals are kept for every host
//! ever contacted, which the allowlist bounds in practice.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::RwLock;
use semblance_audit::{AuditDirection, AuditEntry, AuditStatus};
use semblance_types::ErrorCode;
use serde::{Deserialize, Serialize};

/// Oldest buckets are dropped past this many.
const MAX_TIMELINE_BUCKETS: i64 = 2_000;

/// Look-back window for statistics, attempts and timelines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hour,
    #[serde(alias = "today")]
    Day,
    Week,
    Month,
    #[default]
    All,
}

impl Period {
    /// Start of the window ending at `now`; `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Period::Hour => Some(now - Duration::hours(1)),
            Period::Day => Some(now - Duration::days(1)),
            Period::Week => Some(now - Duration::days(7)),
            Period::Month => Some(now - Duration::days(30)),
            Period::All => None,
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Period::Hour),
            "day" | "today" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "all" => Ok(Period::All),
            other => Err(format!("unknown period: {}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Hour,
    Day,
}

impl Granularity {
    fn step(&self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }
}

/// One resolved outbound call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub audit_ref: String,
    pub request_id: String,
    pub timestamp: String,
    pub action: String,
    pub domain: String,
    /// `success` or `error`.
    pub status: String,
    #[serde(skip)]
    at: DateTime<Utc>,
}

/// A request stopped because its target host is not on the allowlist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnauthorizedAttempt {
    pub audit_ref: String,
    pub request_id: String,
    pub timestamp: String,
    pub action: String,
    pub domain: Option<String>,
    pub reason: String,
    #[serde(skip)]
    at: DateTime<Utc>,
}

/// An admitted call whose outcome is not recorded yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub request_id: String,
    pub action: String,
    pub domain: String,
    pub started_at: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub domain: String,
    pub connection_count: u64,
    pub last_contact: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatistics {
    pub domain: String,
    pub connections: u64,
    pub failures: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatistics {
    pub period: Period,
    pub total_connections: u64,
    pub successful: u64,
    pub failed: u64,
    pub unauthorized_attempts: u64,
    pub unique_hosts: usize,
    pub by_action: BTreeMap<String, u64>,
    /// Busiest first.
    pub by_host: Vec<HostStatistics>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub start: String,
    pub connections: u64,
    pub unauthorized_attempts: u64,
}

#[derive(Clone, Debug)]
struct HostTotals {
    successes: u64,
    last_contact: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<ConnectionRecord>,
    attempts: VecDeque<UnauthorizedAttempt>,
    hosts: HashMap<String, HostTotals>,
    active: HashMap<String, ActiveConnection>,
    last_anomaly: Option<DateTime<Utc>>,
}

pub struct NetworkMonitor {
    capacity: usize,
    state: RwLock<MonitorState>,
}

impl NetworkMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: RwLock::new(MonitorState::default()),
        }
    }

    /// Fold one audit entry into the running view.
    pub fn observe(&self, entry: &AuditEntry) {
        let mut state = self.state.write();
        let domain = entry.metadata_str("targetDomain");

        if entry.status == AuditStatus::RequiresApproval || entry.metadata.contains_key("anomalies") {
            let latest = state.last_anomaly.map_or(entry.timestamp, |t| t.max(entry.timestamp));
            state.last_anomaly = Some(latest);
        }

        match (entry.direction, entry.status) {
            (AuditDirection::Request, AuditStatus::Pending) => {
                if let Some(domain) = domain {
                    state.active.insert(
                        entry.request_id.clone(),
                        ActiveConnection {
                            request_id: entry.request_id.clone(),
                            action: entry.action.clone(),
                            domain: domain.to_string(),
                            started_at: rfc3339(entry.timestamp),
                        },
                    );
                }
            }
            (AuditDirection::Request, _) => {
                let reason = ErrorCode::DomainNotAllowed.rejection_reason();
                if entry.metadata_str("rejectionReason") == Some(reason.as_str()) {
                    let attempt = UnauthorizedAttempt {
                        audit_ref: entry.id.clone(),
                        request_id: entry.request_id.clone(),
                        timestamp: rfc3339(entry.timestamp),
                        action: entry.action.clone(),
                        domain: domain.map(str::to_string),
                        reason,
                        at: entry.timestamp,
                    };
                    push_bounded(&mut state.attempts, attempt, self.capacity);
                }
            }
            (AuditDirection::Response, status) => {
                state.active.remove(&entry.request_id);
                let Some(domain) = domain else {
                    return;
                };
                if status == AuditStatus::Success {
                    let totals = state.hosts.entry(domain.to_string()).or_insert(HostTotals {
                        successes: 0,
                        last_contact: entry.timestamp,
                    });
                    totals.successes += 1;
                    totals.last_contact = totals.last_contact.max(entry.timestamp);
                }
                let record = ConnectionRecord {
                    audit_ref: entry.id.clone(),
                    request_id: entry.request_id.clone(),
                    timestamp: rfc3339(entry.timestamp),
                    action: entry.action.clone(),
                    domain: domain.to_string(),
                    status: status.as_str().to_string(),
                    at: entry.timestamp,
                };
                push_bounded(&mut state.history, record, self.capacity);
            }
        }
    }

    /// Forget in-flight calls. Used after replaying the trail, where a
    /// pending entry without a resolution means the process died mid-call.
    pub fn clear_active(&self) {
        self.state.write().active.clear();
    }

    /// Distinct hosts successfully contacted.
    pub fn contacted_hosts(&self) -> usize {
        self.state.read().hosts.len()
    }

    pub fn anomaly_since(&self, since: DateTime<Utc>) -> bool {
        self.state.read().last_anomaly.is_some_and(|t| t >= since)
    }

    pub fn active_connections(&self) -> Vec<ActiveConnection> {
        let mut active: Vec<_> = self.state.read().active.values().cloned().collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Each allowlisted domain with its successful contact totals.
    pub fn allowlist(&self, domains: &[String]) -> Vec<AllowlistEntry> {
        let state = self.state.read();
        domains
            .iter()
            .map(|domain| {
                let totals = state.hosts.get(domain);
                AllowlistEntry {
                    domain: domain.clone(),
                    connection_count: totals.map_or(0, |t| t.successes),
                    last_contact: totals.map(|t| rfc3339(t.last_contact)),
                }
            })
            .collect()
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Vec<ConnectionRecord> {
        self.state.read().history.iter().rev().take(limit).cloned().collect()
    }

    /// Newest first.
    pub fn unauthorized_attempts(&self, since: Option<DateTime<Utc>>) -> Vec<UnauthorizedAttempt> {
        self.state
            .read()
            .attempts
            .iter()
            .rev()
            .take_while(|a| since.map_or(true, |s| a.at >= s))
            .cloned()
            .collect()
    }

    pub fn statistics(&self, period: Period, now: DateTime<Utc>) -> NetworkStatistics {
        let since = period.since(now);
        let in_window = |at: &DateTime<Utc>| since.map_or(true, |s| *at >= s);
        let state = self.state.read();

        let mut successful = 0;
        let mut failed = 0;
        let mut by_action: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_host: HashMap<&str, HostStatistics> = HashMap::new();
        for record in state.history.iter().filter(|r| in_window(&r.at)) {
            let host = by_host.entry(record.domain.as_str()).or_insert_with(|| HostStatistics {
                domain: record.domain.clone(),
                ..HostStatistics::default()
            });
            host.connections += 1;
            if record.status == AuditStatus::Success.as_str() {
                successful += 1;
            } else {
                failed += 1;
                host.failures += 1;
            }
            *by_action.entry(record.action.clone()).or_insert(0) += 1;
        }

        let mut by_host: Vec<HostStatistics> = by_host.into_values().collect();
        by_host.sort_by(|a, b| {
            b.connections
                .cmp(&a.connections)
                .then_with(|| a.domain.cmp(&b.domain))
        });

        NetworkStatistics {
            period,
            total_connections: successful + failed,
            successful,
            failed,
            unauthorized_attempts: state
                .attempts
                .iter()
                .filter(|a| in_window(&a.at))
                .count() as u64,
            unique_hosts: by_host.len(),
            by_action,
            by_host,
        }
    }

    /// Connection and attempt counts per bucket, oldest first, with empty
    /// buckets included.
    pub fn timeline(
        &self,
        period: Period,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Vec<TimelineBucket> {
        let state = self.state.read();
        let step = granularity.step();
        let earliest = state
            .history
            .front()
            .map(|r| r.at)
            .into_iter()
            .chain(state.attempts.front().map(|a| a.at))
            .min();
        let Some(start) = period.since(now).or(earliest) else {
            return Vec::new();
        };
        let start = bucket_floor(start.max(now - step * MAX_TIMELINE_BUCKETS as i32), step);
        let count = ((now - start).num_seconds() / step.num_seconds() + 1).max(1) as usize;

        let mut buckets: Vec<TimelineBucket> = (0..count)
            .map(|i| TimelineBucket {
                start: rfc3339(start + step * i as i32),
                connections: 0,
                unauthorized_attempts: 0,
            })
            .collect();
        let slot = |at: DateTime<Utc>| -> Option<usize> {
            if at < start || at > now {
                return None;
            }
            Some(((at - start).num_seconds() / step.num_seconds()) as usize).filter(|&i| i < count)
        };
        for record in &state.history {
            if let Some(i) = slot(record.at) {
                buckets[i].connections += 1;
            }
        }
        for attempt in &state.attempts {
            if let Some(i) = slot(attempt.at) {
                buckets[i].unauthorized_attempts += 1;
            }
        }
        buckets
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, capacity: usize) {
    if queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(item);
}

fn bucket_floor(at: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let secs = at.timestamp();
    let floored = secs - secs.rem_euclid(step.num_seconds());
    DateTime::from_timestamp(floored, 0).unwrap_or(at)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
