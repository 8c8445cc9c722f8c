//! Replay protection.
//!
//! A request is admitted at most once per freshness window. The id is
//! recorded in the same critical section that checks it, so two concurrent
//! submissions of one id cannot both pass.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::GuardError;

/// Outcome of an atomic check-then-insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayVerdict {
    /// First sighting within the window; the id is now recorded.
    Fresh,
    /// Already seen within the window.
    Replayed { first_seen: DateTime<Utc> },
}

impl ReplayVerdict {
    pub fn is_replay(&self) -> bool {
        matches!(self, ReplayVerdict::Replayed { .. })
    }
}

/// Storage for recently seen request ids.
///
/// A record lives until `max(first_seen, request_timestamp) + ttl`, the last
/// instant at which the same envelope could still pass the freshness check.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Check `request_id` and record it if unseen, as one atomic step.
    async fn check_and_record(
        &self,
        request_id: &str,
        request_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ReplayVerdict;

    /// Drop every record that expired before `now`. Returns how many were removed.
    async fn purge(&self, now: DateTime<Utc>) -> usize;

    /// Record an id without checking it (startup reconstruction).
    async fn seed(&self, request_id: &str, first_seen: DateTime<Utc>, request_timestamp: DateTime<Utc>);

    async fn len(&self) -> usize;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReplayRecord {
    first_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct ReplayInner {
    seen: HashMap<String, ReplayRecord>,
    /// Insertion order, oldest first. Tuples whose timestamp no longer
    /// matches `seen` are stale and skipped.
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl ReplayInner {
    fn insert(&mut self, request_id: &str, record: ReplayRecord, capacity: usize) {
        while self.seen.len() >= capacity {
            match self.order.pop_front() {
                Some((old_id, old_at)) => {
                    if self.seen.get(&old_id).map(|r| r.first_seen) == Some(old_at) {
                        self.seen.remove(&old_id);
                    }
                }
                None => break,
            }
        }
        self.seen.insert(request_id.to_string(), record);
        self.order.push_back((request_id.to_string(), record.first_seen));
    }
}

/// Capacity-bounded in-memory replay set with oldest-first eviction.
///
/// Not persisted; see [`ReplayGuard::seed`] for rebuilding after a restart.
pub struct MemoryReplayStore {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<ReplayInner>,
}

impl MemoryReplayStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(ReplayInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn record(&self, first_seen: DateTime<Utc>, request_timestamp: DateTime<Utc>) -> ReplayRecord {
        ReplayRecord {
            first_seen,
            expires_at: first_seen.max(request_timestamp) + self.ttl,
        }
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn check_and_record(
        &self,
        request_id: &str,
        request_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ReplayVerdict {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.seen.get(request_id).copied() {
            // An expired record the sweep has not reached yet does not count.
            if now <= existing.expires_at {
                return ReplayVerdict::Replayed {
                    first_seen: existing.first_seen,
                };
            }
            inner.seen.remove(request_id);
        }
        let record = self.record(now, request_timestamp);
        inner.insert(request_id, record, self.capacity);
        ReplayVerdict::Fresh
    }

    async fn purge(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.seen.len();
        inner.seen.retain(|_, record| record.expires_at >= now);
        let ReplayInner { seen, order } = &mut *inner;
        order.retain(|(id, at)| seen.get(id).map(|r| r.first_seen) == Some(*at));
        before - inner.seen.len()
    }

    async fn seed(&self, request_id: &str, first_seen: DateTime<Utc>, request_timestamp: DateTime<Utc>) {
        let record = self.record(first_seen, request_timestamp);
        let mut inner = self.inner.lock();
        if !inner.seen.contains_key(request_id) {
            inner.insert(request_id, record, self.capacity);
        }
    }

    async fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }
}

/// Freshness check plus replay detection over an injected [`ReplayStore`].
pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    ttl: Duration,
}

impl ReplayGuard {
    pub fn new(store: Arc<dyn ReplayStore>, ttl_ms: u64) -> Self {
        Self {
            store,
            ttl: Duration::milliseconds(ttl_ms as i64),
        }
    }

    /// In-memory guard with the given capacity.
    pub fn in_memory(capacity: usize, ttl_ms: u64) -> Self {
        let ttl = Duration::milliseconds(ttl_ms as i64);
        Self {
            store: Arc::new(MemoryReplayStore::new(capacity, ttl)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reject timestamps further than the TTL from `now` in either direction.
    pub fn check_freshness(
        &self,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        let skew = now - timestamp;
        let ttl_ms = self.ttl.num_milliseconds();
        if skew > self.ttl {
            return Err(GuardError::TimestampStale {
                skew_ms: skew.num_milliseconds(),
                ttl_ms,
            });
        }
        if -skew > self.ttl {
            return Err(GuardError::TimestampFuture {
                skew_ms: (-skew).num_milliseconds(),
                ttl_ms,
            });
        }
        Ok(())
    }

    /// Atomic replay check for an envelope stamped `request_timestamp`.
    pub async fn check(
        &self,
        request_id: &str,
        request_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ReplayVerdict {
        self.store.check_and_record(request_id, request_timestamp, now).await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.store.purge(now).await
    }

    /// Re-record ids seen before a restart, as `(id, first_seen,
    /// request_timestamp)`. Ids whose envelope can no longer pass freshness
    /// are ignored.
    pub async fn seed<I>(&self, ids: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = (String, DateTime<Utc>, DateTime<Utc>)>,
    {
        let mut seeded = 0;
        for (id, first_seen, request_timestamp) in ids {
            if first_seen.max(request_timestamp) + self.ttl >= now {
                self.store.seed(&id, first_seen, request_timestamp).await;
                seeded += 1;
            }
        }
        seeded
    }

    pub async fn tracked(&self) -> usize {
        self.store.len().await
    }
}

/// Background purge task. Aborted when dropped.
pub struct SweepHandle {
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn the periodic purge for `guard`.
///
/// The task holds only a weak reference and exits once the guard is gone,
/// so it never keeps the gateway alive.
pub fn spawn_sweeper(guard: &Arc<ReplayGuard>, interval: std::time::Duration) -> SweepHandle {
    let weak: Weak<ReplayGuard> = Arc::downgrade(guard);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(guard) = weak.upgrade() else {
                break;
            };
            let purged = guard.purge_expired(Utc::now()).await;
            if purged > 0 {
                debug!(purged, "Replay sweep purged expired request ids");
            }
        }
    });
    SweepHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-17T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn duplicate_within_ttl_is_replay() {
        let guard = ReplayGuard::in_memory(100, 30_000);
        assert_eq!(guard.check("r2", t0(), t0()).await, ReplayVerdict::Fresh);
        let second = guard.check("r2", t0(), t0() + Duration::milliseconds(5)).await;
        assert_eq!(second, ReplayVerdict::Replayed { first_seen: t0() });
    }

    #[tokio::test]
    async fn id_is_reusable_after_ttl() {
        let guard = ReplayGuard::in_memory(100, 30_000);
        guard.check("r3", t0(), t0()).await;
        let later = t0() + Duration::seconds(31);
        assert_eq!(guard.check("r3", later, later).await, ReplayVerdict::Fresh);
    }

    #[tokio::test]
    async fn future_dated_id_is_held_until_its_envelope_goes_stale() {
        let guard = ReplayGuard::in_memory(100, 30_000);
        let stamped = t0() + Duration::seconds(29);
        assert_eq!(guard.check("dup", stamped, t0()).await, ReplayVerdict::Fresh);

        // Past first_seen + ttl, but the envelope itself is still fresh.
        let later = t0() + Duration::seconds(31);
        assert!(guard.check_freshness(stamped, later).is_ok());
        assert!(guard.check("dup", stamped, later).await.is_replay());
        assert_eq!(guard.purge_expired(later).await, 0);

        let stale = t0() + Duration::seconds(60);
        assert!(guard.check_freshness(stamped, stale).is_err());
        assert_eq!(guard.purge_expired(stale).await, 1);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_first() {
        let store = MemoryReplayStore::new(2, Duration::seconds(30));
        let at = |ms| t0() + Duration::milliseconds(ms);
        store.check_and_record("a", at(0), at(0)).await;
        store.check_and_record("b", at(1), at(1)).await;
        store.check_and_record("c", at(2), at(2)).await;
        assert_eq!(store.len().await, 2);

        assert_eq!(store.check_and_record("a", at(0), at(3)).await, ReplayVerdict::Fresh);
        assert!(store.check_and_record("c", at(2), at(3)).await.is_replay());
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let guard = ReplayGuard::in_memory(100, 30_000);
        guard.check("old", t0(), t0()).await;
        let newer = t0() + Duration::seconds(20);
        guard.check("new", newer, newer).await;

        let purged = guard.purge_expired(t0() + Duration::seconds(40)).await;
        assert_eq!(purged, 1);
        assert_eq!(guard.tracked().await, 1);
    }

    #[tokio::test]
    async fn seed_ignores_expired_ids() {
        let guard = ReplayGuard::in_memory(100, 30_000);
        let now = t0() + Duration::seconds(60);
        let recent = now - Duration::seconds(5);
        let seeded = guard
            .seed(
                vec![
                    ("stale".to_string(), t0(), t0()),
                    ("recent".to_string(), recent, recent),
                    // seen 40s ago, but stamped 25s ahead of that
                    ("ahead".to_string(), now - Duration::seconds(40), now - Duration::seconds(15)),
                ],
                now,
            )
            .await;
        assert_eq!(seeded, 2);
        assert!(guard.check("recent", recent, now).await.is_replay());
        assert!(guard.check("ahead", now - Duration::seconds(15), now).await.is_replay());
        assert_eq!(guard.check("stale", now, now).await, ReplayVerdict::Fresh);
    }

    #[test]
    fn freshness_is_symmetric() {
        let guard = ReplayGuard::in_memory(10, 30_000);
        let now = t0();
        assert!(guard.check_freshness(now - Duration::seconds(29), now).is_ok());
        assert!(guard.check_freshness(now + Duration::seconds(29), now).is_ok());
        assert!(matches!(
            guard.check_freshness(now - Duration::seconds(31), now),
            Err(GuardError::TimestampStale { .. })
        ));
        assert!(matches!(
            guard.check_freshness(now + Duration::seconds(31), now),
            Err(GuardError::TimestampFuture { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_duplicates_admit_exactly_one() {
        let guard = Arc::new(ReplayGuard::in_memory(1000, 30_000));
        let stamped = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move { guard.check("dup", stamped, Utc::now()).await }));
        }
        let mut fresh = 0;
        for h in handles {
            if h.await.unwrap() == ReplayVerdict::Fresh {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_and_stops_with_guard() {
        let guard = Arc::new(ReplayGuard::in_memory(100, 0));
        let earlier = Utc::now() - Duration::seconds(1);
        guard.check("x", earlier, earlier).await;

        let handle = spawn_sweeper(&guard, std::time::Duration::from_secs(60));
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(guard.tracked().await, 0);

        drop(guard);
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(handle.is_finished());
    }
}
