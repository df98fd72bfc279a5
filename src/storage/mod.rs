//! Storage abstractions for harvested posts.
//!
//! Two backends satisfy one [`PostStorage`] contract and are picked once at
//! startup from `storage.backend`:
//!
//! - `tiered`: dedup ledger + handoff queue (fast tier) and a bucketed
//!   wide-column table (durable tier), see [`TieredStorage`]
//! - `file`: a single JSON document keyed by post id, see [`LocalStorage`]

pub mod kv;
pub mod local;
pub mod row_key;
pub mod tiered;
pub mod wide;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BackendKind, Config, Post};

// Re-export for convenience
pub use local::LocalStorage;
pub use row_key::{BucketedKey, RowKeyAllocator, original_key, source_from_key};
pub use tiered::TieredStorage;

/// Outcome of one `dump` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Posts handed over by the worker
    pub received: usize,
    /// Posts with no dedup marker
    pub new: usize,
    /// Posts skipped as already ingested
    pub already_ingested: usize,
    /// Failed fast-tier operations (each followed by a reconnect)
    pub fast_tier_errors: usize,
    /// Rows accepted by the durable tier
    pub durable_written: usize,
    /// Rows in a failed durable batch
    pub durable_lost: usize,
}

impl fmt::Display for DumpSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} received, {} new, {} already ingested, {} fast-tier errors, {} stored, {} lost",
            self.received,
            self.new,
            self.already_ingested,
            self.fast_tier_errors,
            self.durable_written,
            self.durable_lost
        )
    }
}

/// Trait for post storage backends.
#[async_trait]
pub trait PostStorage: Send + Sync {
    /// Open backend connections. Failure here is fatal to the process.
    async fn connect(&self) -> Result<()>;

    /// Close backend connections.
    async fn disconnect(&self) -> Result<()>;

    /// Persist a drained buffer. Best effort: failures are logged and
    /// reflected in the summary, never returned.
    async fn dump(&self, posts: Vec<Post>) -> DumpSummary;
}

/// Build the configured backend and connect it.
pub async fn open(config: &Config) -> Result<Arc<dyn PostStorage>> {
    let storage: Arc<dyn PostStorage> = match config.storage.backend {
        BackendKind::Tiered => Arc::new(TieredStorage::from_config(&config.storage.tiered)),
        BackendKind::File => Arc::new(LocalStorage::new(&config.storage.file.path)),
    };
    storage.connect().await?;
    Ok(storage)
}
