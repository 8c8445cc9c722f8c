//! Integrity verification for audit chains

use semblance_crypto::sha256_hex;
use semblance_types::canonicalize;
use serde::Serialize;
use serde_json::Value;

use crate::entry::AuditEntry;

/// Chain seed used as the predecessor of entry 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// `sha256(previous_hash ‖ canonicalize(content))`, hex-encoded.
pub fn compute_chain_hash(previous_hash: &str, content: &Value) -> String {
    let mut input = String::with_capacity(previous_hash.len() + 256);
    input.push_str(previous_hash);
    input.push_str(&canonicalize(content));
    sha256_hex(input)
}

/// Head of the chain as seen by the appender.
#[derive(Debug, Clone)]
pub struct IntegrityChain {
    last_hash: String,
    entry_count: u64,
}

impl IntegrityChain {
    pub fn new() -> Self {
        Self {
            last_hash: GENESIS_HASH.to_string(),
            entry_count: 0,
        }
    }

    /// Resume after the given entry.
    pub fn resume_after(entry: &AuditEntry) -> Self {
        Self {
            last_hash: entry.chain_hash.clone(),
            entry_count: entry.seq + 1,
        }
    }

    pub fn previous_hash(&self) -> &str {
        &self.last_hash
    }

    /// Sequence number the next entry will receive.
    pub fn next_seq(&self) -> u64 {
        self.entry_count
    }

    pub fn update(&mut self, entry: &AuditEntry) {
        self.last_hash = entry.chain_hash.clone();
        self.entry_count = entry.seq + 1;
    }
}

impl Default for IntegrityChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a full-chain walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub valid: bool,
    pub total_entries: usize,
    /// Entries before the first break.
    pub verified_entries: usize,
    pub first_broken: Option<u64>,
    /// Sequence numbers of every entry whose link does not hold.
    pub broken: Vec<u64>,
}

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Recompute the chain from genesis.
    ///
    /// The walk carries the recomputed hash forward rather than the stored
    /// one, so once a link breaks every later entry is reported too. A
    /// missing entry shows up as a sequence gap at the entry that follows it.
    pub fn verify_chain(entries: &[AuditEntry]) -> ChainReport {
        let mut running = GENESIS_HASH.to_string();
        let mut broken = Vec::new();

        for (position, entry) in entries.iter().enumerate() {
            let expected = entry.expected_chain_hash(&running);
            if expected != entry.chain_hash || entry.seq != position as u64 || !broken.is_empty() {
                broken.push(entry.seq);
            }
            running = expected;
        }

        let first_broken = broken.first().copied();
        let verified_entries = match first_broken {
            Some(_) => entries.len() - broken.len(),
            None => entries.len(),
        };
        ChainReport {
            valid: broken.is_empty(),
            total_entries: entries.len(),
            verified_entries,
            first_broken,
            broken,
        }
    }
}
