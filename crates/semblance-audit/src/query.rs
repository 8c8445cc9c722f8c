//! Audit query support

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::entry::{AuditDirection, AuditEntry, AuditStatus};

/// Filter over the audit trail. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditQuery {
    /// Inclusive.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive.
    pub to: Option<DateTime<Utc>>,
    pub status: Option<AuditStatus>,
    pub action: Option<String>,
    pub direction: Option<AuditDirection>,
    pub request_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Newest first.
    pub descending: bool,
}

impl AuditQuery {
    pub fn builder() -> AuditQueryBuilder {
        AuditQueryBuilder::default()
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp >= to {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if entry.direction != direction {
                return false;
            }
        }
        if let Some(ref request_id) = self.request_id {
            if &entry.request_id != request_id {
                return false;
            }
        }
        true
    }

    /// Filter, order by sequence and paginate. `candidates` must already be
    /// in sequence order.
    pub fn apply<'a, I>(&self, candidates: I) -> Vec<AuditEntry>
    where
        I: IntoIterator<Item = &'a AuditEntry>,
    {
        let mut results: Vec<&AuditEntry> = candidates.into_iter().filter(|e| self.matches(e)).collect();
        if self.descending {
            results.reverse();
        }
        results
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct AuditQueryBuilder {
    query: AuditQuery,
}

impl AuditQueryBuilder {
    pub fn from(mut self, time: DateTime<Utc>) -> Self {
        self.query.from = Some(time);
        self
    }

    pub fn to(mut self, time: DateTime<Utc>) -> Self {
        self.query.to = Some(time);
        self
    }

    pub fn status(mut self, status: AuditStatus) -> Self {
        self.query.status = Some(status);
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.query.action = Some(action.into());
        self
    }

    pub fn direction(mut self, direction: AuditDirection) -> Self {
        self.query.direction = Some(direction);
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.query.request_id = Some(request_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// Newest first.
    pub fn descending(mut self) -> Self {
        self.query.descending = true;
        self
    }

    pub fn ascending(mut self) -> Self {
        self.query.descending = false;
        self
    }

    pub fn build(self) -> AuditQuery {
        self.query
    }
}
