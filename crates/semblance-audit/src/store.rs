//! Durable storage for sealed audit entries

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, warn};

use crate::entry::AuditEntry;
use crate::error::{AuditError, Result};

/// Backend that persists sealed entries in append order.
///
/// Stores never re-hash or reorder; they only keep what the trail gives them.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably record `entry`. The trail treats an error as "not recorded".
    async fn persist(&self, entry: &AuditEntry) -> Result<()>;

    /// Every stored entry, in append order.
    async fn load(&self) -> Result<Vec<AuditEntry>>;

    fn describe(&self) -> String;
}

/// Volatile store for tests and ephemeral gateways.
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn persist(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.read().clone())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// File the JSON-lines store appends to.
#[async_trait]
pub(crate) trait LineSink: Send {
    async fn end_offset(&mut self) -> io::Result<u64>;
    async fn write_line(&mut self, line: &[u8]) -> io::Result<()>;
    async fn sync(&mut self) -> io::Result<()>;
    async fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl LineSink for File {
    async fn end_offset(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.write_all(line).await?;
        self.flush().await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_data().await
    }

    async fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await?;
        self.sync_data().await
    }
}

/// Append-only JSON-lines file, one entry per line, fsynced per append.
///
/// A failed append is truncated away, so the file only ever holds entries
/// the trail acknowledged. If that rollback fails too, the store refuses
/// every later append.
pub struct JsonlAuditStore {
    path: PathBuf,
    poisoned: AtomicBool,
}

impl JsonlAuditStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Ok(Self {
            path,
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poisoned_error(&self) -> AuditError {
        AuditError::Poisoned {
            path: self.path.display().to_string(),
        }
    }

    pub(crate) async fn append_line<S: LineSink>(&self, sink: &mut S, line: &[u8]) -> Result<()> {
        if self.is_poisoned() {
            return Err(self.poisoned_error());
        }
        let start = sink.end_offset().await?;
        let written = match sink.write_line(line).await {
            Ok(()) => sink.sync().await,
            Err(e) => Err(e),
        };
        let Err(cause) = written else {
            return Ok(());
        };
        match sink.truncate_to(start).await {
            Ok(()) => {
                warn!(path = %self.path.display(), error = %cause, "Audit append failed, rolled back");
                Err(cause.into())
            }
            Err(rollback) => {
                self.poisoned.store(true, Ordering::Release);
                error!(
                    path = %self.path.display(),
                    error = %cause,
                    rollback_error = %rollback,
                    "Audit append failed and could not be rolled back"
                );
                Err(self.poisoned_error())
            }
        }
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn persist(&self, entry: &AuditEntry) -> Result<()> {
        if self.is_poisoned() {
            return Err(self.poisoned_error());
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.append_line(&mut file, line.as_bytes()).await
    }

    async fn load(&self) -> Result<Vec<AuditEntry>> {
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut raw = Vec::new();
        while let Some(line) = lines.next_line().await? {
            raw.push(line);
        }

        let last = raw.iter().rposition(|l| !l.trim().is_empty());
        let mut entries = Vec::with_capacity(raw.len());
        for (index, line) in raw.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line means a crash mid-append: that entry was
                // never acknowledged, so it is dropped.
                Err(e) if Some(index) == last => {
                    warn!(path = %self.path.display(), line = index + 1, error = %e, "Ignoring torn trailing audit record");
                }
                Err(e) => {
                    return Err(AuditError::Corrupt {
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(entries)
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}
