//! Durable tier: a wide-column table keyed by [`BucketedKey`].
//!
//! ## Local layout
//!
//! ```text
//! {durable_root}/
//! └── {table}/
//!     ├── region-00.jsonl   # rows whose key starts with bucket 00
//!     ├── region-01.jsonl
//!     └── ...               # one region per bucket prefix
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::row_key::BucketedKey;

/// Column family -> qualifier -> value.
pub type Families = BTreeMap<String, BTreeMap<String, String>>;

/// A staged write of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMutation {
    pub row_key: BucketedKey,
    pub families: Families,
}

impl RowMutation {
    pub fn new(row_key: BucketedKey) -> Self {
        Self {
            row_key,
            families: Families::new(),
        }
    }

    /// Add a cell to the mutation.
    pub fn add(
        mut self,
        family: impl Into<String>,
        qualifier: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.families
            .entry(family.into())
            .or_default()
            .insert(qualifier.into(), value.into());
        self
    }

    pub fn cell(&self, family: &str, qualifier: &str) -> Option<&str> {
        cell(&self.families, family, qualifier)
    }
}

fn cell<'a>(families: &'a Families, family: &str, qualifier: &str) -> Option<&'a str> {
    families
        .get(family)
        .and_then(|cells| cells.get(qualifier))
        .map(String::as_str)
}

/// A row as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row_key: String,
    pub families: Families,
}

impl StoredRow {
    pub fn cell(&self, family: &str, qualifier: &str) -> Option<&str> {
        cell(&self.families, family, qualifier)
    }
}

impl From<RowMutation> for StoredRow {
    fn from(mutation: RowMutation) -> Self {
        Self {
            row_key: mutation.row_key.into_string(),
            families: mutation.families,
        }
    }
}

/// Contract of the durable-tier client.
#[async_trait]
pub trait WideColumnStore: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &str {
        "durable-tier"
    }

    async fn connect(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Write all rows as one batch. Rows within a batch are unordered.
    ///
    /// A batch that fails after storing some rows returns
    /// [`AppError::PartialWrite`] with the number stored.
    async fn put_batch(&self, rows: Vec<RowMutation>) -> Result<()>;
}

/// In-process table keeping rows in key order. Clones share rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryWideColumnStore {
    rows: Arc<Mutex<BTreeMap<String, Families>>>,
    connected: Arc<AtomicBool>,
}

impl MemoryWideColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// All rows in key order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows
            .lock()
            .iter()
            .map(|(row_key, families)| StoredRow {
                row_key: row_key.clone(),
                families: families.clone(),
            })
            .collect()
    }

    /// Rows holding `value` in `family:qualifier`.
    pub fn find(&self, family: &str, qualifier: &str, value: &str) -> Vec<StoredRow> {
        self.rows()
            .into_iter()
            .filter(|row| row.cell(family, qualifier) == Some(value))
            .collect()
    }
}

#[async_trait]
impl WideColumnStore for MemoryWideColumnStore {
    fn name(&self) -> &str {
        "memory-table"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn put_batch(&self, rows: Vec<RowMutation>) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(AppError::connection(self.name(), "not connected"));
        }
        let mut table = self.rows.lock();
        for row in rows {
            let families = table.entry(row.row_key.into_string()).or_default();
            for (family, cells) in row.families {
                families.entry(family).or_default().extend(cells);
            }
        }
        Ok(())
    }
}

/// Table stored as append-only JSON-lines region files, one per bucket.
#[derive(Debug, Clone)]
pub struct LocalWideColumnStore {
    table_dir: PathBuf,
    connected: bool,
}

impl LocalWideColumnStore {
    /// Create a store for `table` under `root`. Nothing touches disk before `connect`.
    pub fn new(root: impl AsRef<Path>, table: &str) -> Self {
        Self {
            table_dir: root.as_ref().join(table),
            connected: false,
        }
    }

    fn region_path(&self, prefix: &str) -> PathBuf {
        self.table_dir.join(format!("region-{prefix}.jsonl"))
    }

    /// Read back every row of one region.
    pub async fn load_region(&self, prefix: &str) -> Result<Vec<StoredRow>> {
        let content = match tokio::fs::read_to_string(self.region_path(prefix)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AppError::from))
            .collect()
    }

    async fn append_region(&self, prefix: &str, payload: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.region_path(prefix))
            .await?;
        file.write_all(payload).await?;
        file.flush().await?;
        Ok(())
    }
}

fn region_payload(rows: &[StoredRow]) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut payload, row)?;
        payload.push(b'\n');
    }
    Ok(payload)
}

#[async_trait]
impl WideColumnStore for LocalWideColumnStore {
    fn name(&self) -> &str {
        "local-table"
    }

    async fn connect(&mut self) -> Result<()> {
        tokio::fs::create_dir_all(&self.table_dir)
            .await
            .map_err(|e| {
                AppError::connection("local-table", format!("{}: {e}", self.table_dir.display()))
            })?;
        self.connected = true;
        log::info!("Durable table ready at {}", self.table_dir.display());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn put_batch(&self, rows: Vec<RowMutation>) -> Result<()> {
        if !self.connected {
            return Err(AppError::connection(self.name(), "not connected"));
        }

        let mut by_region: BTreeMap<String, Vec<StoredRow>> = BTreeMap::new();
        for row in rows {
            by_region
                .entry(row.row_key.bucket_prefix().to_string())
                .or_default()
                .push(StoredRow::from(row));
        }

        // serialise everything up front so only I/O can fail mid-batch
        let mut payloads = Vec::with_capacity(by_region.len());
        for (prefix, rows) in &by_region {
            payloads.push((prefix, rows.len(), region_payload(rows)?));
        }

        let mut written = 0;
        for (prefix, count, payload) in &payloads {
            if let Err(e) = self.append_region(prefix, payload).await {
                let message = format!("region {prefix}: {e}");
                return Err(if written == 0 {
                    AppError::connection(self.name(), message)
                } else {
                    AppError::PartialWrite {
                        backend: self.name().to_string(),
                        written,
                        message,
                    }
                });
            }
            written += count;
        }
        log::debug!("Wrote {written} rows across {} regions", payloads.len());
        Ok(())
    }
}
