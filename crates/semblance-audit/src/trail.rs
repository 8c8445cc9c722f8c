//! The indexed, hash-chained audit trail

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::entry::{ActionLogEntry, AuditDirection, AuditEntry, AuditRecord, AuditStatus};
use crate::error::Result;
use crate::integrity::{ChainReport, IntegrityChain, IntegrityVerifier};
use crate::query::AuditQuery;
use crate::store::{AuditStore, MemoryAuditStore};

#[derive(Default)]
struct AuditIndex {
    /// Position == seq for an intact chain.
    entries: Vec<AuditEntry>,
    by_id: HashMap<String, usize>,
    by_time: BTreeMap<DateTime<Utc>, Vec<usize>>,
    by_status: HashMap<AuditStatus, Vec<usize>>,
    by_request: HashMap<String, Vec<usize>>,
}

impl AuditIndex {
    fn insert(&mut self, entry: AuditEntry) {
        let pos = self.entries.len();
        self.by_id.insert(entry.id.clone(), pos);
        self.by_time.entry(entry.timestamp).or_default().push(pos);
        self.by_status.entry(entry.status).or_default().push(pos);
        self.by_request
            .entry(entry.request_id.clone())
            .or_default()
            .push(pos);
        self.entries.push(entry);
    }

    fn collect(&self, positions: &[usize]) -> Vec<AuditEntry> {
        positions.iter().map(|&p| self.entries[p].clone()).collect()
    }

    /// Positions with `from <= timestamp < to`, in sequence order.
    fn positions_in_range(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Vec<usize> {
        use std::ops::Bound;
        let lower = from.map(Bound::Included).unwrap_or(Bound::Unbounded);
        let upper = to.map(Bound::Excluded).unwrap_or(Bound::Unbounded);
        if let (Some(f), Some(t)) = (from, to) {
            if f >= t {
                return Vec::new();
            }
        }
        let mut positions: Vec<usize> = self
            .by_time
            .range((lower, upper))
            .flat_map(|(_, ps)| ps.iter().copied())
            .collect();
        positions.sort_unstable();
        positions
    }
}

/// Append-only audit ledger.
///
/// Appends are globally ordered by one async mutex that is held across the
/// store write: the chain needs a single writer, and an entry is only indexed
/// once the store has acknowledged it. Reads go through the index and never
/// wait on an append in flight.
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    head: Mutex<IntegrityChain>,
    index: RwLock<AuditIndex>,
}

impl AuditTrail {
    /// Open a trail over `store`, reloading and verifying its history.
    ///
    /// A broken chain is reported but does not prevent opening: the history
    /// stays readable and new entries chain from the last stored hash.
    pub async fn open(store: Arc<dyn AuditStore>) -> Result<Self> {
        let entries = store.load().await?;
        let report = IntegrityVerifier::verify_chain(&entries);
        if !report.valid {
            warn!(
                store = %store.describe(),
                first_broken = ?report.first_broken,
                broken = report.broken.len(),
                "Audit chain verification failed on open"
            );
        }

        let head = entries
            .last()
            .map(IntegrityChain::resume_after)
            .unwrap_or_default();
        let mut index = AuditIndex::default();
        for entry in entries {
            index.insert(entry);
        }
        info!(
            store = %store.describe(),
            entries = index.entries.len(),
            "Audit trail opened"
        );

        Ok(Self {
            store,
            head: Mutex::new(head),
            index: RwLock::new(index),
        })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryAuditStore::new())).await
    }

    /// Seal `record` into the chain and persist it. Returns the sealed entry;
    /// its `id` is the audit reference.
    pub async fn append(&self, record: AuditRecord) -> Result<AuditEntry> {
        let mut head = self.head.lock().await;
        let entry = record.finalize(head.next_seq(), head.previous_hash());
        self.store.persist(&entry).await?;
        head.update(&entry);
        self.index.write().insert(entry.clone());
        drop(head);

        debug!(
            seq = entry.seq,
            audit_id = %entry.id,
            request_id = %entry.request_id,
            status = entry.status.as_str(),
            "Audit entry appended"
        );
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<AuditEntry> {
        let index = self.index.read();
        index.by_id.get(id).map(|&p| index.entries[p].clone())
    }

    /// Every entry for one request, pending before resolved.
    pub fn by_request(&self, request_id: &str) -> Vec<AuditEntry> {
        let index = self.index.read();
        index
            .by_request
            .get(request_id)
            .map(|ps| index.collect(ps))
            .unwrap_or_default()
    }

    /// Entries with `from <= timestamp < to`, oldest first.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AuditEntry> {
        let index = self.index.read();
        let positions = index.positions_in_range(Some(from), Some(to));
        index.collect(&positions)
    }

    pub fn by_status(&self, status: AuditStatus) -> Vec<AuditEntry> {
        let index = self.index.read();
        index
            .by_status
            .get(&status)
            .map(|ps| index.collect(ps))
            .unwrap_or_default()
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let index = self.index.read();
        let positions: Vec<usize> = if let Some(ref request_id) = query.request_id {
            index.by_request.get(request_id).cloned().unwrap_or_default()
        } else if let Some(status) = query.status {
            index.by_status.get(&status).cloned().unwrap_or_default()
        } else if query.from.is_some() || query.to.is_some() {
            index.positions_in_range(query.from, query.to)
        } else {
            (0..index.entries.len()).collect()
        };
        query.apply(positions.iter().map(|&p| &index.entries[p]))
    }

    /// Walk the whole chain from genesis.
    pub fn verify(&self) -> ChainReport {
        let index = self.index.read();
        IntegrityVerifier::verify_chain(&index.entries)
    }

    /// Newest-first page of terminal entries.
    pub fn action_log(&self, limit: usize, offset: usize) -> Vec<ActionLogEntry> {
        let index = self.index.read();
        index
            .entries
            .iter()
            .rev()
            .filter(|e| e.status.is_terminal())
            .skip(offset)
            .take(limit)
            .map(ActionLogEntry::from)
            .collect()
    }

    /// Seconds saved by successful actions completed in `[from, to)`.
    pub fn time_saved(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
        let index = self.index.read();
        index
            .positions_in_range(Some(from), Some(to))
            .into_iter()
            .map(|p| &index.entries[p])
            .filter(|e| e.direction == AuditDirection::Response && e.status == AuditStatus::Success)
            .map(|e| e.estimated_time_saved_seconds)
            .sum()
    }

    /// First request-side entry per request id recorded at or after `since`,
    /// mapped through `select`. Entries for which `select` returns `None`
    /// are skipped and do not claim the id.
    pub fn recent_requests<T, F>(&self, since: DateTime<Utc>, select: F) -> Vec<T>
    where
        F: Fn(&AuditEntry) -> Option<T>,
    {
        let index = self.index.read();
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for p in index.positions_in_range(Some(since), None) {
            let entry = &index.entries[p];
            if entry.direction != AuditDirection::Request || seen.contains(entry.request_id.as_str()) {
                continue;
            }
            if let Some(value) = select(entry) {
                seen.insert(entry.request_id.as_str());
                selected.push(value);
            }
        }
        selected
    }

    /// Visit every entry in append order without copying the ledger.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&AuditEntry),
    {
        for entry in &self.index.read().entries {
            visit(entry);
        }
    }

    /// Most recently appended entry.
    pub fn head(&self) -> Option<AuditEntry> {
        self.index.read().entries.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store_description(&self) -> String {
        self.store.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditError;
    use crate::store::JsonlAuditStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::json;

    async fn trail() -> AuditTrail {
        AuditTrail::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_sequence_and_links() {
        let trail = trail().await;
        let a = trail
            .append(AuditRecord::request("r1", "web.fetch", AuditStatus::Pending).payload(&json!({"url": "x"})))
            .await
            .unwrap();
        let b = trail
            .append(AuditRecord::response("r1", "web.fetch", AuditStatus::Success).time_saved(20))
            .await
            .unwrap();
        assert_eq!((a.seq, b.seq), (0, 1));
        assert_eq!(b.expected_chain_hash(&a.chain_hash), b.chain_hash);
        assert_eq!(trail.head().unwrap().id, b.id);
        assert_eq!(trail.get(&a.id).unwrap(), a);
        assert!(trail.verify().valid);
    }

    #[tokio::test]
    async fn indices_answer_lookups() {
        let trail = trail().await;
        let start = Utc::now() - Duration::seconds(1);
        trail.append(AuditRecord::request("r1", "web.fetch", AuditStatus::Rejected)).await.unwrap();
        trail.append(AuditRecord::request("r2", "email.send", AuditStatus::Pending)).await.unwrap();
        trail
            .append(AuditRecord::response("r2", "email.send", AuditStatus::Success).time_saved(45))
            .await
            .unwrap();
        let end = Utc::now() + Duration::seconds(1);

        assert_eq!(trail.by_request("r2").len(), 2);
        assert_eq!(trail.by_status(AuditStatus::Rejected).len(), 1);
        assert_eq!(trail.range(start, end).len(), 3);
        assert!(trail.range(end, end + Duration::seconds(5)).is_empty());
        assert_eq!(trail.time_saved(start, end), 45);

        let log = trail.action_log(10, 0);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, "success");
        assert_eq!(log[1].status, "rejected");
        assert_eq!(trail.action_log(1, 1).len(), 1);

        let q = AuditQuery::builder().action("email.send").descending().build();
        assert_eq!(trail.query(&q)[0].status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn recent_requests_dedupes() {
        let trail = trail().await;
        trail.append(AuditRecord::request("r1", "web.fetch", AuditStatus::Pending)).await.unwrap();
        trail.append(AuditRecord::response("r1", "web.fetch", AuditStatus::Success)).await.unwrap();
        trail.append(AuditRecord::request("r2", "web.fetch", AuditStatus::Rejected)).await.unwrap();

        let since = Utc::now() - Duration::seconds(30);
        let all = trail.recent_requests(since, |e| Some(e.request_id.clone()));
        assert_eq!(all, vec!["r1", "r2"]);

        let pending_only = trail.recent_requests(since, |e| {
            (e.status == AuditStatus::Pending).then(|| e.request_id.clone())
        });
        assert_eq!(pending_only, vec!["r1"]);
    }

    #[tokio::test]
    async fn for_each_visits_in_append_order() {
        let trail = trail().await;
        for id in ["a", "b", "c"] {
            trail.append(AuditRecord::request(id, "web.fetch", AuditStatus::Rejected)).await.unwrap();
        }
        let mut seen = Vec::new();
        trail.for_each(|e| seen.push((e.seq, e.request_id.clone())));
        assert_eq!(
            seen,
            vec![(0, "a".to_string()), (1, "b".to_string()), (2, "c".to_string())]
        );
    }

    #[tokio::test]
    async fn concurrent_appends_form_one_chain() {
        let trail = Arc::new(trail().await);
        let mut handles = Vec::new();
        for i in 0..32 {
            let trail = trail.clone();
            handles.push(tokio::spawn(async move {
                trail
                    .append(AuditRecord::request(format!("r{}", i), "web.search", AuditStatus::Pending))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let report = trail.verify();
        assert!(report.valid);
        assert_eq!(report.total_entries, 32);
    }

    #[tokio::test]
    async fn reopening_file_trail_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let store = Arc::new(JsonlAuditStore::new(&path).await.unwrap());
            let trail = AuditTrail::open(store).await.unwrap();
            trail.append(AuditRecord::request("r1", "web.fetch", AuditStatus::Pending)).await.unwrap();
            trail.append(AuditRecord::response("r1", "web.fetch", AuditStatus::Success)).await.unwrap();
        }
        let store = Arc::new(JsonlAuditStore::new(&path).await.unwrap());
        let trail = AuditTrail::open(store).await.unwrap();
        assert_eq!(trail.len(), 2);
        let next = trail.append(AuditRecord::request("r2", "web.fetch", AuditStatus::Rejected)).await.unwrap();
        assert_eq!(next.seq, 2);
        assert!(trail.verify().valid);
    }

    #[tokio::test]
    async fn tampered_file_is_detected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let store = Arc::new(JsonlAuditStore::new(&path).await.unwrap());
            let trail = AuditTrail::open(store).await.unwrap();
            for i in 0..4 {
                trail
                    .append(AuditRecord::request(format!("r{}", i), "email.send", AuditStatus::Rejected))
                    .await
                    .unwrap();
            }
        }
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let tampered = contents.replacen("\"requestId\":\"r1\"", "\"requestId\":\"rX\"", 1);
        assert_ne!(contents, tampered);
        tokio::fs::write(&path, tampered).await.unwrap();

        let store = Arc::new(JsonlAuditStore::new(&path).await.unwrap());
        let trail = AuditTrail::open(store).await.unwrap();
        let report = trail.verify();
        assert!(!report.valid);
        assert_eq!(report.broken, vec![1, 2, 3]);
    }

    struct FailingStore;

    #[async_trait]
    impl AuditStore for FailingStore {
        async fn persist(&self, _entry: &AuditEntry) -> Result<()> {
            Err(AuditError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }

        async fn load(&self) -> Result<Vec<AuditEntry>> {
            Ok(Vec::new())
        }

        fn describe(&self) -> String {
            "failing".into()
        }
    }

    #[tokio::test]
    async fn failed_persist_leaves_chain_untouched() {
        let trail = AuditTrail::open(Arc::new(FailingStore)).await.unwrap();
        let result = trail.append(AuditRecord::request("r1", "web.fetch", AuditStatus::Pending)).await;
        assert!(result.is_err());
        assert!(trail.is_empty());
        assert!(trail.head().is_none());
    }
}
