//! # semblance-audit
//!
//! Tamper-evident record of every action the gateway is asked to perform.
//!
//! Entries are sequence-numbered and immutable once appended. Each entry's
//! `chainHash` is `sha256(previous chainHash ‖ canonical entry)`, seeded with
//! [`GENESIS_HASH`], so altering or deleting any historical entry breaks the
//! link for it and everything after it. There is deliberately no API that
//! updates or removes a stored entry.
//!
//! The [`AuditTrail`] serializes appends (the hash chain needs one global
//! order), persists through an [`AuditStore`], and keeps in-memory indices
//! for time-range, status and request-id lookups.

pub mod entry;
pub mod error;
pub mod integrity;
pub mod query;
pub mod store;
pub mod trail;

pub use entry::{ActionLogEntry, AuditDirection, AuditEntry, AuditRecord, AuditStatus};
pub use error::{AuditError, Result};
pub use integrity::{ChainReport, IntegrityChain, IntegrityVerifier, GENESIS_HASH};
pub use query::{AuditQuery, AuditQueryBuilder};
pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};
pub use trail::AuditTrail;
