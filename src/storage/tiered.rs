//! Tiered storage: dedup ledger and handoff queue in the fast tier,
//! long-term record in the durable tier.
//!
//! Every `dump` runs inside one process-wide critical section, so at most
//! one flush talks to either backend at a time. Failures are handled per
//! post and per connection; nothing propagates back to the worker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{DurableKind, Post, TieredConfig};
use crate::storage::kv::{
    Bin, KeyValueStore, MemoryKeyValueStore, RecordKey, WritePolicy, with_retries,
};
use crate::storage::row_key::RowKeyAllocator;
use crate::storage::wide::{
    LocalWideColumnStore, MemoryWideColumnStore, RowMutation, WideColumnStore,
};
use crate::storage::{DumpSummary, PostStorage};

struct Tiers {
    fast: Box<dyn KeyValueStore>,
    durable: Box<dyn WideColumnStore>,
}

/// Two-tier persistence gateway.
pub struct TieredStorage {
    tiers: Mutex<Tiers>,
    allocator: Arc<RowKeyAllocator>,
    settings: TieredConfig,
    marker_policy: WritePolicy,
    handoff_policy: WritePolicy,
}

impl TieredStorage {
    pub fn new(
        fast: Box<dyn KeyValueStore>,
        durable: Box<dyn WideColumnStore>,
        allocator: Arc<RowKeyAllocator>,
        settings: TieredConfig,
    ) -> Self {
        Self {
            tiers: Mutex::new(Tiers { fast, durable }),
            allocator,
            settings,
            marker_policy: WritePolicy::dedup_marker(),
            handoff_policy: WritePolicy::handoff_queue(),
        }
    }

    /// Build the backends named by the configuration. The fast tier is an
    /// in-process ledger.
    pub fn from_config(settings: &TieredConfig) -> Self {
        let durable: Box<dyn WideColumnStore> = match settings.durable {
            DurableKind::Local => Box::new(LocalWideColumnStore::new(
                &settings.durable_root,
                &settings.table,
            )),
            DurableKind::Memory => Box::new(MemoryWideColumnStore::new()),
        };
        Self::new(
            Box::new(MemoryKeyValueStore::new()),
            durable,
            Arc::new(RowKeyAllocator::new()),
            settings.clone(),
        )
    }

    fn marker_key(&self, post: &Post) -> RecordKey {
        RecordKey::new(
            format!("{}{}", self.settings.dedup_namespace_prefix, post.source),
            &self.settings.dedup_set,
            &post.post_id,
        )
    }

    fn handoff_key(&self, post: &Post) -> RecordKey {
        RecordKey::new(
            &self.settings.handoff_namespace,
            &self.settings.handoff_set,
            &post.post_id,
        )
    }

    /// Durable row for a post confirmed new.
    fn stage(&self, post: &Post) -> Result<RowMutation> {
        let row_key = self.allocator.generate_id(post.source.as_str())?;
        let primary = &self.settings.primary_family;
        let secondary = &self.settings.secondary_family;
        Ok(RowMutation::new(row_key)
            .add(primary, "content", &post.content)
            .add(primary, "language", &post.language)
            .add(primary, "post_timestamp", &post.publication_timestamp)
            .add(primary, "author_nick", &post.author_nickname)
            .add(secondary, "post_id", &post.post_id)
            .add(secondary, "author_name", &post.author_name)
            .add(secondary, "author_id", &post.author_id))
    }

    async fn is_ingested(&self, fast: &dyn KeyValueStore, key: &RecordKey) -> Result<bool> {
        with_retries(&self.marker_policy.retry, fast.name(), move || fast.exists(key)).await
    }

    async fn put(
        &self,
        fast: &dyn KeyValueStore,
        policy: &WritePolicy,
        key: &RecordKey,
        bins: &[Bin],
    ) -> Result<()> {
        with_retries(&policy.retry, fast.name(), move || fast.put(policy, key, bins)).await
    }
}

async fn reconnect_fast(fast: &mut dyn KeyValueStore) {
    log::warn!("Reconnecting {}", fast.name());
    if let Err(e) = fast.close().await {
        log::debug!("Closing {} failed: {e}", fast.name());
    }
    if let Err(e) = fast.connect().await {
        log::error!("Reconnect of {} failed: {e}", fast.name());
    }
}

async fn reconnect_durable(durable: &mut dyn WideColumnStore) {
    log::warn!("Reconnecting {}", durable.name());
    if let Err(e) = durable.close().await {
        log::debug!("Closing {} failed: {e}", durable.name());
    }
    if let Err(e) = durable.connect().await {
        log::error!("Reconnect of {} failed: {e}", durable.name());
    }
}

#[async_trait]
impl PostStorage for TieredStorage {
    async fn connect(&self) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        tiers.fast.connect().await?;
        tiers.durable.connect().await?;
        log::info!(
            "Connected to {} and {} (salt {})",
            tiers.fast.name(),
            tiers.durable.name(),
            self.allocator.host_salt()
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut tiers = self.tiers.lock().await;
        let fast = tiers.fast.close().await;
        let durable = tiers.durable.close().await;
        log::info!("Storage connections closed");
        fast.and(durable)
    }

    async fn dump(&self, posts: Vec<Post>) -> DumpSummary {
        let mut tiers = self.tiers.lock().await;
        let mut summary = DumpSummary {
            received: posts.len(),
            ..DumpSummary::default()
        };
        let mut staged = Vec::new();

        for post in &posts {
            let marker_key = self.marker_key(post);

            let ingested = match self.is_ingested(tiers.fast.as_ref(), &marker_key).await {
                Ok(ingested) => ingested,
                Err(e) => {
                    log::error!("Dedup lookup for {marker_key} failed: {e}");
                    summary.fast_tier_errors += 1;
                    reconnect_fast(tiers.fast.as_mut()).await;
                    false
                }
            };
            if ingested {
                summary.already_ingested += 1;
                continue;
            }
            summary.new += 1;

            let marker = [Bin::new("processed", true)];
            if let Err(e) = self
                .put(tiers.fast.as_ref(), &self.marker_policy, &marker_key, &marker)
                .await
            {
                log::error!("Dedup marker write for {marker_key} failed: {e}");
                summary.fast_tier_errors += 1;
                reconnect_fast(tiers.fast.as_mut()).await;
            }

            let handoff_key = self.handoff_key(post);
            let entry = [
                Bin::new("post_id", post.post_id.as_str()),
                Bin::new("content", post.content.as_str()),
                Bin::new("language", post.language.as_str()),
            ];
            match self
                .put(tiers.fast.as_ref(), &self.handoff_policy, &handoff_key, &entry)
                .await
            {
                Ok(()) => {}
                Err(AppError::RecordExists { key }) => {
                    log::warn!("Handoff entry {key} already queued");
                }
                Err(e) => {
                    log::error!("Handoff write for {handoff_key} failed: {e}");
                    summary.fast_tier_errors += 1;
                    reconnect_fast(tiers.fast.as_mut()).await;
                }
            }

            match self.stage(post) {
                Ok(row) => staged.push(row),
                Err(e) => log::error!("Cannot key post {}: {e}", post.post_id),
            }
        }

        if staged.is_empty() {
            return summary;
        }

        let rows = staged.len();
        match tiers.durable.put_batch(staged).await {
            Ok(()) => summary.durable_written = rows,
            Err(e) => {
                let written = match &e {
                    AppError::PartialWrite { written, .. } => (*written).min(rows),
                    _ => 0,
                };
                summary.durable_written = written;
                summary.durable_lost = rows - written;
                log::error!(
                    "Durable batch failed: {e}; {} posts are marked processed but not stored",
                    summary.durable_lost
                );
                reconnect_durable(tiers.durable.as_mut()).await;
            }
        }
        summary
    }
}
