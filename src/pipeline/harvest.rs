// src/pipeline/harvest.rs

//! Process-level harvest orchestration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::Config;
use crate::pipeline::partition::partition;
use crate::pipeline::worker::{
    CrawlWorker, PollingSupplier, StreamingSupplier, WorkerContext, WorkerReport,
};
use crate::services::{PostStream, SearchClient};
use crate::storage::PostStorage;

/// Ingestion sources handed to the harvest.
#[derive(Default)]
pub struct Sources {
    pub search: Option<Arc<dyn SearchClient>>,
    pub stream: Option<Box<dyn PostStream>>,
}

/// Per-worker reports of one harvest.
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    pub streaming: Option<WorkerReport>,
    pub polling: Vec<WorkerReport>,
}

impl HarvestReport {
    pub fn total(&self) -> WorkerReport {
        let mut total = WorkerReport::default();
        for report in self.streaming.iter().chain(&self.polling) {
            total.merge(report);
        }
        total
    }
}

async fn join(name: &str, handle: JoinHandle<WorkerReport>) -> Result<WorkerReport> {
    handle.await.map_err(|e| AppError::ingest(name, e))
}

/// Run every configured worker to completion and close storage.
///
/// Polling workers start first, then the streaming worker; its completion
/// is awaited before the polling workers'. Storage is disconnected even
/// when a worker task fails.
pub async fn run_harvest(
    config: &Config,
    storage: Arc<dyn PostStorage>,
    sources: Sources,
    shutdown: watch::Receiver<bool>,
) -> Result<HarvestReport> {
    let harvest = &config.harvest;
    let context = WorkerContext::from_config(config, Arc::clone(&storage), shutdown.clone())?;

    let stream = match (harvest.streaming, sources.stream) {
        (true, Some(stream)) => Some(stream),
        (true, None) => return Err(AppError::config("streaming enabled but no stream source")),
        (false, _) => None,
    };
    let search = match (harvest.workers, sources.search) {
        (0, _) => None,
        (_, Some(search)) => Some(search),
        (_, None) => return Err(AppError::config("polling enabled but no search source")),
    };

    let start = Instant::now();
    log::info!(
        "Harvest started at {} with {} polling workers, streaming {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        harvest.workers,
        if stream.is_some() { "on" } else { "off" }
    );

    let mut pollers = Vec::new();
    if let Some(search) = search {
        let assignments = partition(&config.languages(), &config.terms, harvest.workers)?;
        for (index, assignment) in assignments.into_iter().enumerate() {
            let name = format!("poller-{index}");
            log::debug!("{name} terms: {assignment:?}");
            let supplier = PollingSupplier::new(
                Arc::clone(&search),
                assignment,
                config.source.page_size,
                Duration::from_secs(harvest.poll_interval_secs),
                shutdown.clone(),
            );
            let worker = CrawlWorker::new(name.clone(), Box::new(supplier), &context, start);
            pollers.push((name, tokio::spawn(worker.run())));
        }
    }

    let result = collect(stream, pollers, &context, start).await;

    if let Err(e) = storage.disconnect().await {
        log::error!("Closing storage failed: {e}");
    }

    let report = result?;
    let total = report.total();
    log::info!(
        "Harvest finished in {}s: {} accepted, {} flushed in {} flushes",
        start.elapsed().as_secs(),
        total.accepted,
        total.posts_flushed,
        total.flushes
    );
    Ok(report)
}

async fn collect(
    stream: Option<Box<dyn PostStream>>,
    pollers: Vec<(String, JoinHandle<WorkerReport>)>,
    context: &WorkerContext,
    start: Instant,
) -> Result<HarvestReport> {
    let mut report = HarvestReport::default();
    let mut failure = None;

    if let Some(stream) = stream {
        let supplier = StreamingSupplier::new(stream, context.shutdown.clone());
        let worker = CrawlWorker::new("streamer", Box::new(supplier), context, start);
        match join("streamer", tokio::spawn(worker.run())).await {
            Ok(streaming) => report.streaming = Some(streaming),
            Err(e) => {
                log::error!("streamer failed: {e}");
                failure = Some(e);
            }
        }
    }

    // every poller is awaited before the first failure is reported
    for (name, handle) in pollers {
        match join(&name, handle).await {
            Ok(polling) => report.polling.push(polling),
            Err(e) => {
                log::error!("{name} failed: {e}");
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DurableKind, TieredConfig};
    use crate::services::testing::{ScriptedSearch, ScriptedStream, raw_post};
    use crate::storage::kv::{KeyValueStore, MemoryKeyValueStore};
    use crate::storage::wide::{MemoryWideColumnStore, WideColumnStore};
    use crate::storage::{RowKeyAllocator, TieredStorage};
    use std::collections::BTreeMap;

    fn config(workers: usize, streaming: bool) -> Config {
        let mut config = Config::default();
        config.harvest.workers = workers;
        config.harvest.streaming = streaming;
        config.harvest.poll_interval_secs = 0;
        config.harvest.buffer_size = 2;
        config.terms = BTreeMap::from([
            ("en".to_string(), vec!["rust".to_string(), "tokio".to_string()]),
            ("es".to_string(), vec!["hola".to_string()]),
        ]);
        config
    }

    async fn tiered() -> (Arc<TieredStorage>, MemoryKeyValueStore, MemoryWideColumnStore) {
        let fast = MemoryKeyValueStore::new();
        let table = MemoryWideColumnStore::new();
        let storage = TieredStorage::new(
            Box::new(fast.clone()) as Box<dyn KeyValueStore>,
            Box::new(table.clone()) as Box<dyn WideColumnStore>,
            Arc::new(RowKeyAllocator::new()),
            TieredConfig {
                durable: DurableKind::Memory,
                ..TieredConfig::default()
            },
        );
        storage.connect().await.unwrap();
        (Arc::new(storage), fast, table)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end_dedup_across_sources() {
        let (storage, fast, table) = tiered().await;
        let (tx, rx) = watch::channel(false);

        let stream = ScriptedStream::new(vec![
            raw_post(1, "en"),
            raw_post(2, "xx"),
            raw_post(3, "es"),
            raw_post(4, "en"),
        ]);
        // the poller sees 1 and 3 again, plus 5
        let search = ScriptedSearch::new(vec![
            vec![raw_post(1, "en"), raw_post(5, "en")],
            vec![raw_post(3, "es")],
        ]);
        let sources = Sources {
            search: Some(Arc::new(search.clone())),
            stream: Some(Box::new(stream)),
        };

        // stop polling once the pages are used up and the stream is stored
        let stopper = {
            let search = search.clone();
            let table = table.clone();
            tokio::spawn(async move {
                while search.queries.lock().len() < 3 || table.len() < 4 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tx.send(true).ok();
            })
        };

        let report = run_harvest(&config(1, true), storage, sources, rx)
            .await
            .unwrap();
        stopper.await.unwrap();

        let streaming = report.streaming.clone().unwrap();
        assert_eq!(streaming.accepted, 3);
        assert_eq!(streaming.rejected_language, 1);
        assert_eq!(report.polling.len(), 1);

        let mut stored: Vec<_> = table
            .rows()
            .iter()
            .filter_map(|row| row.cell("s", "post_id").map(str::to_string))
            .collect();
        stored.sort();
        assert_eq!(stored, vec!["1", "3", "4", "5"]);
        assert_eq!(fast.count("ingest_classifier", "input_buffer"), 4);
    }

    /// Stream whose worker task dies on the first read.
    struct PanickingStream;

    #[async_trait::async_trait]
    impl PostStream for PanickingStream {
        async fn next_post(&mut self) -> Result<Option<crate::models::RawPost>> {
            panic!("stream decoder crashed");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_streamer_still_awaits_pollers() {
        let (storage, _, table) = tiered().await;
        let (tx, rx) = watch::channel(false);
        let search = ScriptedSearch::new(vec![vec![raw_post(5, "en")]]);
        let sources = Sources {
            search: Some(Arc::new(search.clone())),
            stream: Some(Box::new(PanickingStream)),
        };

        let stopper = {
            let search = search.clone();
            tokio::spawn(async move {
                while search.queries.lock().len() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                tx.send(true).ok();
            })
        };

        let result = run_harvest(&config(1, true), storage, sources, rx).await;
        stopper.await.unwrap();

        assert!(matches!(result, Err(AppError::Ingest { .. })));
        // the poller drained its buffer before the harvest returned
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_polling_only_requires_search_source() {
        let (storage, _, _) = tiered().await;
        let (_tx, rx) = watch::channel(false);
        let result = run_harvest(&config(2, false), storage, Sources::default(), rx).await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_streaming_only() {
        let (storage, _, table) = tiered().await;
        let (_tx, rx) = watch::channel(false);
        let sources = Sources {
            search: None,
            stream: Some(Box::new(ScriptedStream::new(vec![
                raw_post(1, "en"),
                raw_post(2, "en"),
                raw_post(3, "en"),
            ]))),
        };

        let report = run_harvest(&config(0, true), storage, sources, rx).await.unwrap();

        assert!(report.polling.is_empty());
        assert_eq!(report.total().posts_flushed, 3);
        assert_eq!(table.len(), 3);
    }
}
