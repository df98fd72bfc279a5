//! Fast tier: the key-value store holding dedup markers and the handoff queue.
//!
//! The real client is an external collaborator; this module fixes the
//! contract it must satisfy ([`KeyValueStore`]), the write policies the
//! gateway uses, and an in-process ledger ([`MemoryKeyValueStore`]).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Dedup markers expire after two days.
pub const DEDUP_RETENTION_SECS: u32 = 172_800;

/// Address of a record: namespace, set, user key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub namespace: String,
    pub set: String,
    pub key: String,
}

impl RecordKey {
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set: set.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.set, self.key)
    }
}

/// A named value stored in a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub name: String,
    pub value: BinValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BinValue {
    Bool(bool),
    Str(String),
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<BinValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl From<bool> for BinValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for BinValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for BinValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Record time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    Seconds(u32),
}

/// What a write does when the record already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordExistsAction {
    Replace,
    CreateOnly,
}

/// Timeout and retry budget for one fast-tier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub sleep_between_retries: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_retries: 5,
            sleep_between_retries: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub expiration: Expiration,
    pub record_exists: RecordExistsAction,
    pub retry: RetryPolicy,
}

impl WritePolicy {
    /// Dedup markers: two-day retention, overwrite allowed.
    pub fn dedup_marker() -> Self {
        Self {
            expiration: Expiration::Seconds(DEDUP_RETENTION_SECS),
            record_exists: RecordExistsAction::Replace,
            retry: RetryPolicy::default(),
        }
    }

    /// Handoff queue entries: never expire, never overwritten.
    pub fn handoff_queue() -> Self {
        Self {
            expiration: Expiration::Never,
            record_exists: RecordExistsAction::CreateOnly,
            retry: RetryPolicy::default(),
        }
    }
}

/// Contract of the fast-tier client.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name used in logs and errors.
    fn name(&self) -> &str {
        "fast-tier"
    }

    async fn connect(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn exists(&self, key: &RecordKey) -> Result<bool>;

    async fn put(&self, policy: &WritePolicy, key: &RecordKey, bins: &[Bin]) -> Result<()>;
}

/// Run `op` under `policy`: each attempt is bounded by the timeout, and
/// retryable failures are retried after a pause until the budget runs out.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, backend: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let error = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => AppError::Timeout {
                backend: backend.to_string(),
            },
        };

        if attempt >= policy.max_retries {
            return Err(error);
        }
        attempt += 1;
        log::debug!("{backend}: attempt {attempt} failed ({error}), retrying");
        tokio::time::sleep(policy.sleep_between_retries).await;
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    bins: Vec<Bin>,
    expires_at: Option<Instant>,
}

impl StoredRecord {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process fast tier honouring TTLs and create-only writes.
///
/// Clones share the same records, so a handle kept outside the gateway sees
/// everything the gateway wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    records: Arc<Mutex<HashMap<RecordKey, StoredRecord>>>,
    connected: Arc<AtomicBool>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bins of a live record.
    pub fn get(&self, key: &RecordKey) -> Option<Vec<Bin>> {
        let now = Instant::now();
        self.records
            .lock()
            .get(key)
            .filter(|record| record.is_live(now))
            .map(|record| record.bins.clone())
    }

    /// Number of live records in a namespace/set.
    pub fn count(&self, namespace: &str, set: &str) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .iter()
            .filter(|(k, r)| k.namespace == namespace && k.set == set && r.is_live(now))
            .count()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AppError::connection("memory-kv", "not connected"))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    fn name(&self) -> &str {
        "memory-kv"
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn exists(&self, key: &RecordKey) -> Result<bool> {
        self.ensure_connected()?;
        let now = Instant::now();
        Ok(self
            .records
            .lock()
            .get(key)
            .is_some_and(|record| record.is_live(now)))
    }

    async fn put(&self, policy: &WritePolicy, key: &RecordKey, bins: &[Bin]) -> Result<()> {
        self.ensure_connected()?;
        let now = Instant::now();
        let mut records = self.records.lock();

        let occupied = records.get(key).is_some_and(|record| record.is_live(now));
        if occupied && policy.record_exists == RecordExistsAction::CreateOnly {
            return Err(AppError::RecordExists {
                key: key.to_string(),
            });
        }

        let expires_at = match policy.expiration {
            Expiration::Never => None,
            Expiration::Seconds(secs) => Some(now + Duration::from_secs(u64::from(secs))),
        };
        records.insert(
            key.clone(),
            StoredRecord {
                bins: bins.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    async fn connected() -> MemoryKeyValueStore {
        let mut kv = MemoryKeyValueStore::new();
        kv.connect().await.unwrap();
        kv
    }

    #[tokio::test]
    async fn test_put_and_exists() {
        let kv = connected().await;
        let key = RecordKey::new("ingest_twttr", "ids", "123");

        assert!(!kv.exists(&key).await.unwrap());
        kv.put(&WritePolicy::dedup_marker(), &key, &[Bin::new("processed", true)])
            .await
            .unwrap();
        assert!(kv.exists(&key).await.unwrap());
        assert_eq!(kv.get(&key).unwrap()[0].value, BinValue::Bool(true));
    }

    #[tokio::test]
    async fn test_create_only_rejects_existing() {
        let kv = connected().await;
        let key = RecordKey::new("ingest_classifier", "input_buffer", "123");
        let policy = WritePolicy::handoff_queue();

        kv.put(&policy, &key, &[Bin::new("content", "a")]).await.unwrap();
        let err = kv.put(&policy, &key, &[Bin::new("content", "b")]).await;

        assert!(matches!(err, Err(AppError::RecordExists { .. })));
        assert_eq!(kv.get(&key).unwrap()[0].value, BinValue::Str("a".into()));
    }

    #[tokio::test]
    async fn test_replace_overwrites() {
        let kv = connected().await;
        let key = RecordKey::new("ingest_twttr", "ids", "1");
        let policy = WritePolicy::dedup_marker();

        kv.put(&policy, &key, &[Bin::new("processed", false)]).await.unwrap();
        kv.put(&policy, &key, &[Bin::new("processed", true)]).await.unwrap();
        assert_eq!(kv.count("ingest_twttr", "ids"), 1);
        assert_eq!(kv.get(&key).unwrap()[0].value, BinValue::Bool(true));
    }

    #[tokio::test]
    async fn test_expired_records_are_absent() {
        let kv = connected().await;
        let key = RecordKey::new("ns", "ids", "1");
        let policy = WritePolicy {
            expiration: Expiration::Seconds(0),
            ..WritePolicy::dedup_marker()
        };

        kv.put(&policy, &key, &[Bin::new("processed", true)]).await.unwrap();
        assert!(!kv.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_store_fails() {
        let mut kv = connected().await;
        kv.close().await.unwrap();
        let err = kv.exists(&RecordKey::new("ns", "ids", "1")).await;
        assert!(matches!(err, Err(AppError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_with_retries_recovers_from_transient_errors() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            sleep_between_retries: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let counter = &attempts;
        let value = with_retries(&policy, "kv", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::connection("kv", "reset"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            sleep_between_retries: Duration::from_millis(1),
            ..RetryPolicy::default()
        };

        let counter = &attempts;
        let result: Result<()> = with_retries(&policy, "kv", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::connection("kv", "down"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_does_not_retry_conflicts() {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let result: Result<()> = with_retries(&RetryPolicy::default(), "kv", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::RecordExists { key: "k".into() })
        })
        .await;

        assert!(matches!(result, Err(AppError::RecordExists { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retries_times_out() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(5),
            max_retries: 0,
            sleep_between_retries: Duration::from_millis(1),
        };
        let result: Result<()> = with_retries(&policy, "kv", || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(AppError::Timeout { .. })));
    }
}
