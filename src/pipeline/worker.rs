//! Crawl workers.
//!
//! A worker owns one [`PostBuffer`] and one [`PostSupplier`]. After every
//! unit of work it checks whether to stop (time budget or shutdown), then
//! whether to flush. Stopping always drains the buffer first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{Config, Post, RawPost, SourceTag};
use crate::pipeline::buffer::PostBuffer;
use crate::pipeline::flush::FlushPolicy;
use crate::pipeline::partition::TermAssignment;
use crate::services::{PostStream, SearchClient, SearchQuery};
use crate::storage::PostStorage;

/// Where a worker's posts come from.
#[async_trait]
pub trait PostSupplier: Send {
    /// Next unit of work. `None` means the source is exhausted.
    async fn next_unit(&mut self) -> Result<Option<Vec<RawPost>>>;
}

/// Sleep for `delay`. Returns false if shutdown was requested meanwhile.
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => {
            if changed.is_err() {
                // sender gone, no shutdown can arrive any more
                tokio::time::sleep(delay).await;
                return true;
            }
            !*shutdown.borrow()
        }
    }
}

/// One post per unit, pulled from a push stream.
///
/// Consecutive read failures back off exponentially, from `initial_backoff`
/// up to `max_backoff`, before the stream is read again.
pub struct StreamingSupplier {
    stream: Box<dyn PostStream>,
    shutdown: watch::Receiver<bool>,
    failures: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl StreamingSupplier {
    pub fn new(stream: Box<dyn PostStream>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            stream,
            shutdown,
            failures: 0,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    fn backoff(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

#[async_trait]
impl PostSupplier for StreamingSupplier {
    async fn next_unit(&mut self) -> Result<Option<Vec<RawPost>>> {
        if self.failures > 0 {
            let delay = self.backoff();
            log::debug!("Reading stream again in {delay:?}");
            if !pause(&mut self.shutdown, delay).await {
                return Ok(Some(Vec::new()));
            }
        }
        match self.stream.next_post().await {
            Ok(post) => {
                self.failures = 0;
                Ok(post.map(|post| vec![post]))
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                Err(e)
            }
        }
    }
}

/// One search page per unit, cycling over the worker's languages.
pub struct PollingSupplier {
    client: Arc<dyn SearchClient>,
    queries: Vec<SearchQuery>,
    cursor: usize,
    interval: Duration,
    polled: bool,
    shutdown: watch::Receiver<bool>,
}

impl PollingSupplier {
    /// Languages assigned no terms are never queried.
    pub fn new(
        client: Arc<dyn SearchClient>,
        assignment: TermAssignment,
        page_size: usize,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let queries = assignment
            .into_iter()
            .filter(|(_, terms)| !terms.is_empty())
            .map(|(language, terms)| SearchQuery {
                language,
                terms,
                count: page_size,
            })
            .collect();
        Self {
            client,
            queries,
            cursor: 0,
            interval,
            polled: false,
            shutdown,
        }
    }

}

#[async_trait]
impl PostSupplier for PollingSupplier {
    async fn next_unit(&mut self) -> Result<Option<Vec<RawPost>>> {
        if self.queries.is_empty() {
            log::warn!("No search terms assigned, nothing to poll");
            return Ok(None);
        }
        if self.polled && !pause(&mut self.shutdown, self.interval).await {
            return Ok(Some(Vec::new()));
        }
        self.polled = true;

        let query = &self.queries[self.cursor];
        self.cursor = (self.cursor + 1) % self.queries.len();
        Ok(Some(self.client.search(query).await?))
    }
}

/// Settings and handles shared by every worker of a harvest.
#[derive(Clone)]
pub struct WorkerContext {
    pub storage: Arc<dyn PostStorage>,
    pub languages: Arc<HashSet<String>>,
    pub source_tag: SourceTag,
    pub minutes: u64,
    pub buffer_size: usize,
    pub progress_every: usize,
    pub shutdown: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn from_config(
        config: &Config,
        storage: Arc<dyn PostStorage>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Ok(Self {
            storage,
            languages: Arc::new(config.languages().into_iter().collect()),
            source_tag: config.source_tag()?,
            minutes: config.harvest.minutes,
            buffer_size: config.harvest.buffer_size,
            progress_every: config.harvest.progress_every,
            shutdown,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Flushing,
    Draining,
    Stopped,
}

/// Counters of one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected_language: usize,
    pub source_errors: usize,
    pub flushes: usize,
    pub posts_flushed: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: &WorkerReport) {
        self.accepted += other.accepted;
        self.duplicates += other.duplicates;
        self.rejected_language += other.rejected_language;
        self.source_errors += other.source_errors;
        self.flushes += other.flushes;
        self.posts_flushed += other.posts_flushed;
    }
}

pub struct CrawlWorker {
    name: String,
    supplier: Box<dyn PostSupplier>,
    buffer: PostBuffer,
    policy: FlushPolicy,
    context: WorkerContext,
    state: WorkerState,
    report: WorkerReport,
}

impl CrawlWorker {
    pub fn new(
        name: impl Into<String>,
        supplier: Box<dyn PostSupplier>,
        context: &WorkerContext,
        start: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            supplier,
            buffer: PostBuffer::new(),
            policy: FlushPolicy::new(start, context.minutes, context.buffer_size),
            context: context.clone(),
            state: WorkerState::Starting,
            report: WorkerReport::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, state: WorkerState) {
        log::debug!("{}: {:?} -> {:?}", self.name, self.state, state);
        self.state = state;
    }

    /// Harvest until the source ends, the budget runs out or shutdown is requested.
    pub async fn run(mut self) -> WorkerReport {
        log::info!("{} started", self.name);
        self.set_state(WorkerState::Running);

        loop {
            match self.supplier.next_unit().await {
                Ok(Some(posts)) => {
                    for raw in posts {
                        self.accept(raw);
                    }
                }
                Ok(None) => {
                    log::info!("{}: source exhausted", self.name);
                    break;
                }
                Err(e) => {
                    log::warn!("{}: source error: {e}", self.name);
                    self.report.source_errors += 1;
                }
            }

            if self.should_stop() {
                break;
            }
            if self.policy.should_flush(self.buffer.size()) {
                self.flush().await;
            }
        }

        self.set_state(WorkerState::Draining);
        self.flush().await;
        self.set_state(WorkerState::Stopped);
        log::info!(
            "{} stopped: {} accepted, {} duplicates, {} rejected by language, {} flushes",
            self.name,
            self.report.accepted,
            self.report.duplicates,
            self.report.rejected_language,
            self.report.flushes
        );
        self.report
    }

    fn should_stop(&self) -> bool {
        let shutdown = *self.context.shutdown.borrow();
        if shutdown {
            log::info!("{}: shutdown requested", self.name);
        }
        shutdown || self.policy.should_stop(Instant::now())
    }

    fn accept(&mut self, raw: RawPost) {
        if !self.context.languages.contains(&raw.lang.to_lowercase()) {
            self.report.rejected_language += 1;
            return;
        }

        let post = Post::from_raw(&self.context.source_tag, raw);
        if !self.buffer.try_add(post) {
            self.report.duplicates += 1;
            return;
        }

        self.report.accepted += 1;
        let every = self.context.progress_every;
        if every > 0 && self.report.accepted % every == 0 {
            log::debug!(
                "{}: {} posts accepted, {} buffered",
                self.name,
                self.report.accepted,
                self.buffer.size()
            );
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let resume = self.state;
        self.set_state(WorkerState::Flushing);

        let posts = self.buffer.snapshot_and_clear();
        let count = posts.len();
        match self.policy.minutes_left(Instant::now()) {
            Some(left) => log::info!("{}: flushing {count} posts ({left} min left)", self.name),
            None => log::info!("{}: flushing {count} posts", self.name),
        }

        let summary = self.context.storage.dump(posts).await;
        log::info!("{}: {summary}", self.name);

        self.report.flushes += 1;
        self.report.posts_flushed += count;
        self.set_state(resume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::services::testing::{ScriptedSearch, ScriptedStream, raw_post};
    use crate::storage::DumpSummary;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Storage double recording the post ids of every dump.
    #[derive(Default)]
    struct RecordingStorage {
        dumps: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingStorage {
        fn dumps(&self) -> Vec<Vec<String>> {
            self.dumps.lock().clone()
        }
    }

    #[async_trait]
    impl PostStorage for RecordingStorage {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn dump(&self, posts: Vec<Post>) -> DumpSummary {
            let mut ids: Vec<_> = posts.iter().map(|p| p.post_id.clone()).collect();
            ids.sort();
            self.dumps.lock().push(ids);
            DumpSummary {
                received: posts.len(),
                ..DumpSummary::default()
            }
        }
    }

    /// Stream failing once before yielding its posts.
    struct HiccupStream {
        failed: bool,
        inner: ScriptedStream,
    }

    #[async_trait]
    impl PostStream for HiccupStream {
        async fn next_post(&mut self) -> Result<Option<RawPost>> {
            if !self.failed {
                self.failed = true;
                return Err(AppError::ingest("stream", "connection reset"));
            }
            self.inner.next_post().await
        }
    }

    /// Stream whose every read fails.
    struct DeadStream;

    #[async_trait]
    impl PostStream for DeadStream {
        async fn next_post(&mut self) -> Result<Option<RawPost>> {
            Err(AppError::ingest("stream", "connection refused"))
        }
    }

    fn context(
        storage: Arc<RecordingStorage>,
        buffer_size: usize,
        minutes: u64,
    ) -> (WorkerContext, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let context = WorkerContext {
            storage,
            languages: Arc::new(["en".to_string(), "es".to_string()].into()),
            source_tag: SourceTag::new("twttr").unwrap(),
            minutes,
            buffer_size,
            progress_every: 50,
            shutdown: rx,
        };
        (context, tx)
    }

    fn streaming(ctx: &WorkerContext, posts: Vec<RawPost>) -> Box<dyn PostSupplier> {
        let stream = Box::new(ScriptedStream::new(posts));
        Box::new(StreamingSupplier::new(stream, ctx.shutdown.clone()))
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_threshold_flush_then_drain() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, _tx) = context(Arc::clone(&storage), 2, 0);
        let posts = vec![raw_post(1, "en"), raw_post(2, "en"), raw_post(3, "en")];
        let supplier = streaming(&ctx, posts);

        let report = CrawlWorker::new("streamer", supplier, &ctx, Instant::now())
            .run()
            .await;

        // one threshold flush with {1, 2}; 3 waits for the final drain
        assert_eq!(storage.dumps(), vec![ids(&["1", "2"]), ids(&["3"])]);
        assert_eq!(report.flushes, 2);
        assert_eq!(report.posts_flushed, 3);
    }

    #[tokio::test]
    async fn test_foreign_language_never_reaches_storage() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, _tx) = context(Arc::clone(&storage), 10, 0);
        let supplier = streaming(&ctx, vec![raw_post(1, "xx"), raw_post(2, "EN")]);

        let report = CrawlWorker::new("streamer", supplier, &ctx, Instant::now())
            .run()
            .await;

        assert_eq!(report.rejected_language, 1);
        assert_eq!(storage.dumps(), vec![ids(&["2"])]);
    }

    #[tokio::test]
    async fn test_duplicates_dropped() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, _tx) = context(Arc::clone(&storage), 10, 0);
        let posts = vec![raw_post(1, "en"), raw_post(1, "en"), raw_post(2, "es")];
        let supplier = streaming(&ctx, posts);

        let report = CrawlWorker::new("streamer", supplier, &ctx, Instant::now())
            .run()
            .await;

        assert_eq!(report.accepted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(storage.dumps(), vec![ids(&["1", "2"])]);
    }

    #[tokio::test]
    async fn test_shutdown_drains_after_current_unit() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, tx) = context(Arc::clone(&storage), 10, 0);
        tx.send(true).unwrap();
        let supplier = streaming(&ctx, (1..=5).map(|id| raw_post(id, "en")).collect());

        let report = CrawlWorker::new("streamer", supplier, &ctx, Instant::now())
            .run()
            .await;

        assert_eq!(report.accepted, 1);
        assert_eq!(storage.dumps(), vec![ids(&["1"])]);
    }

    #[tokio::test]
    async fn test_expired_budget_stops_worker() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, _tx) = context(Arc::clone(&storage), 10, 1);
        let start = Instant::now().checked_sub(Duration::from_secs(61)).unwrap();
        let supplier = streaming(&ctx, vec![raw_post(1, "en"), raw_post(2, "en")]);

        let report = CrawlWorker::new("streamer", supplier, &ctx, start).run().await;

        assert_eq!(report.accepted, 1);
        assert_eq!(storage.dumps(), vec![ids(&["1"])]);
    }

    #[tokio::test]
    async fn test_source_error_is_survived() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, _tx) = context(Arc::clone(&storage), 10, 0);
        let stream = HiccupStream {
            failed: false,
            inner: ScriptedStream::new(vec![raw_post(1, "en")]),
        };
        let supplier = StreamingSupplier::new(Box::new(stream), ctx.shutdown.clone())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1));

        let report = CrawlWorker::new("streamer", Box::new(supplier), &ctx, Instant::now())
            .run()
            .await;

        assert_eq!(report.source_errors, 1);
        assert_eq!(storage.dumps(), vec![ids(&["1"])]);
    }

    #[tokio::test]
    async fn test_failing_stream_backs_off_until_shutdown() {
        let storage = Arc::new(RecordingStorage::default());
        let (ctx, tx) = context(Arc::clone(&storage), 10, 0);
        let supplier = StreamingSupplier::new(Box::new(DeadStream), ctx.shutdown.clone())
            .with_backoff(Duration::from_millis(50), Duration::from_secs(1));
        let worker = CrawlWorker::new("streamer", Box::new(supplier), &ctx, Instant::now());

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let report = handle.await.unwrap();

        // 50 + 100 ms of waiting fit in the window, the 200 ms wait is cut short
        assert!((1..=5).contains(&report.source_errors), "{report:?}");
        assert!(storage.dumps().is_empty());
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let (_tx, rx) = watch::channel(false);
        let mut supplier = StreamingSupplier::new(Box::new(DeadStream), rx)
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<_> = (1..=4)
            .map(|failures| {
                supplier.failures = failures;
                supplier.backoff().as_millis()
            })
            .collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[tokio::test]
    async fn test_polling_cycles_languages_with_terms() {
        let search = ScriptedSearch::new(vec![vec![raw_post(1, "en")], vec![raw_post(2, "gl")]]);
        let (_tx, rx) = watch::channel(false);
        let assignment = BTreeMap::from([
            ("en".to_string(), ids(&["a", "b"])),
            ("es".to_string(), Vec::new()),
            ("gl".to_string(), ids(&["c"])),
        ]);
        let mut supplier = PollingSupplier::new(
            Arc::new(search.clone()),
            assignment,
            25,
            Duration::ZERO,
            rx,
        );

        assert_eq!(supplier.next_unit().await.unwrap().unwrap().len(), 1);
        assert_eq!(supplier.next_unit().await.unwrap().unwrap().len(), 1);
        assert!(supplier.next_unit().await.unwrap().unwrap().is_empty());

        let queries = search.queries.lock().clone();
        let languages: Vec<_> = queries.iter().map(|q| q.language.as_str()).collect();
        assert_eq!(languages, vec!["en", "gl", "en"]);
        assert_eq!(queries[0].text(), "a OR b");
        assert_eq!(queries[0].count, 25);
    }

    #[tokio::test]
    async fn test_polling_without_terms_finishes() {
        let (_tx, rx) = watch::channel(false);
        let assignment = BTreeMap::from([("en".to_string(), Vec::new())]);
        let mut supplier = PollingSupplier::new(
            Arc::new(ScriptedSearch::default()),
            assignment,
            25,
            Duration::ZERO,
            rx,
        );
        assert!(supplier.next_unit().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_polling_pause_interrupted_by_shutdown() {
        let (tx, rx) = watch::channel(false);
        let assignment = BTreeMap::from([("en".to_string(), ids(&["a"]))]);
        let search = ScriptedSearch::default();
        let mut supplier = PollingSupplier::new(
            Arc::new(search.clone()),
            assignment,
            25,
            Duration::from_secs(3600),
            rx,
        );

        supplier.next_unit().await.unwrap();
        let pending = tokio::spawn(async move { supplier.next_unit().await });
        tx.send(true).unwrap();

        let unit = pending.await.unwrap().unwrap().unwrap();
        assert!(unit.is_empty());
        assert_eq!(search.queries.lock().len(), 1);
    }

    #[test]
    fn test_report_merge() {
        let mut total = WorkerReport::default();
        let one = WorkerReport {
            accepted: 2,
            flushes: 1,
            posts_flushed: 2,
            ..WorkerReport::default()
        };
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.accepted, 4);
        assert_eq!(total.flushes, 2);
    }
}
