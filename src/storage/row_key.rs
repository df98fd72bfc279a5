//! Row key allocation for the durable tier.
//!
//! Keys are fixed-width strings, read left to right:
//!
//! ```text
//! 07 9223370336854775807 twttr aB3x 42
//! |  |                   |     |    +-- random suffix (2 digits, 10-99)
//! |  |                   |     +------- host salt (4 chars)
//! |  |                   +------------- source tag (5 chars)
//! |  +--------------------------------- i64::MAX - now_millis (19 digits)
//! +------------------------------------ bucket prefix (00-31, round-robin)
//! ```
//!
//! The inverted timestamp makes lexicographic order newest-first within a
//! bucket; the round-robin prefix spreads consecutive writes over all
//! buckets regardless of how clustered the timestamps are.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::SOURCE_TAG_LEN;

/// Number of buckets the key space is split into.
pub const BUCKET_COUNT: usize = 32;
/// Digits of the bucket prefix.
pub const BUCKET_WIDTH: usize = 2;
/// Digits of `i64::MAX`.
pub const TIMESTAMP_WIDTH: usize = 19;
pub const HOST_SALT_WIDTH: usize = 4;
pub const SUFFIX_WIDTH: usize = 2;
/// Total key length.
pub const KEY_LEN: usize =
    BUCKET_WIDTH + TIMESTAMP_WIDTH + SOURCE_TAG_LEN + HOST_SALT_WIDTH + SUFFIX_WIDTH;

const SOURCE_OFFSET: usize = BUCKET_WIDTH + TIMESTAMP_WIDTH;
const SALT_OFFSET: usize = SOURCE_OFFSET + SOURCE_TAG_LEN;
const SUFFIX_OFFSET: usize = SALT_OFFSET + HOST_SALT_WIDTH;

const SUFFIX_MIN: u32 = 10;
const SUFFIX_MAX: u32 = 99;
const RANDOM_ATTEMPTS: usize = 32;

/// Pause while waiting for the clock to leave an exhausted millisecond.
const CLOCK_WAIT: Duration = Duration::from_micros(100);

/// Millisecond clock used for the inverted timestamp.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A bucketed durable-tier row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketedKey(String);

impl BucketedKey {
    /// Wrap an existing key, checking only its length.
    pub fn parse(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        check_len(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bucket prefix as text (`"00"`..`"31"`).
    pub fn bucket_prefix(&self) -> &str {
        &self.0[..BUCKET_WIDTH]
    }

    /// Bucket index. Keys built by [`RowKeyAllocator`] always carry a numeric prefix.
    pub fn bucket(&self) -> Option<usize> {
        self.bucket_prefix().parse().ok()
    }

    /// The key without its bucket prefix.
    pub fn original(&self) -> &str {
        &self.0[BUCKET_WIDTH..]
    }

    pub fn source(&self) -> &str {
        &self.0[SOURCE_OFFSET..SALT_OFFSET]
    }

    pub fn host_salt(&self) -> &str {
        &self.0[SALT_OFFSET..SUFFIX_OFFSET]
    }

    pub fn suffix(&self) -> &str {
        &self.0[SUFFIX_OFFSET..]
    }

    /// Recover the generation time in epoch milliseconds.
    pub fn timestamp_millis(&self) -> Option<i64> {
        let reversed: i64 = self.0[BUCKET_WIDTH..SOURCE_OFFSET].parse().ok()?;
        Some(i64::MAX - reversed)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for BucketedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_len(key: &str) -> Result<()> {
    if key.len() != KEY_LEN || !key.is_ascii() {
        return Err(AppError::invalid_argument(format!(
            "row key must be {KEY_LEN} ASCII characters, got {} bytes",
            key.len()
        )));
    }
    Ok(())
}

/// Extract the source tag from a bucketed key.
pub fn source_from_key(key: &str) -> Result<&str> {
    check_len(key)?;
    Ok(&key[SOURCE_OFFSET..SALT_OFFSET])
}

/// Strip the bucket prefix from a bucketed key.
pub fn original_key(key: &str) -> Result<&str> {
    check_len(key)?;
    Ok(&key[BUCKET_WIDTH..])
}

struct AllocatorState {
    /// Next bucket in the round-robin
    counter: usize,
    /// Millisecond the `issued` set belongs to
    window_millis: i64,
    /// Original keys issued during `window_millis`
    issued: HashSet<String>,
    rng: StdRng,
}

/// Generates unique, reverse-chronological, bucket-spread row keys.
///
/// One allocator is shared by every caller in the process; the bucket
/// cursor and the collision window are guarded by a single lock.
pub struct RowKeyAllocator {
    host_salt: String,
    clock: Clock,
    state: Mutex<AllocatorState>,
}

impl RowKeyAllocator {
    /// Allocator salted with this host's name, seeded with the process id.
    pub fn new() -> Self {
        let clock: Clock = Arc::new(|| Utc::now().timestamp_millis());
        Self::build(
            host_salt(&hostname()),
            u64::from(std::process::id()),
            clock,
        )
    }

    /// Allocator with explicit salt, seed and clock.
    pub fn with_parts(host_salt: impl Into<String>, seed: u64, clock: Clock) -> Result<Self> {
        let host_salt = host_salt.into();
        if host_salt.len() != HOST_SALT_WIDTH || !host_salt.is_ascii() {
            return Err(AppError::invalid_argument(format!(
                "host salt must be {HOST_SALT_WIDTH} ASCII characters"
            )));
        }
        Ok(Self::build(host_salt, seed, clock))
    }

    fn build(host_salt: String, seed: u64, clock: Clock) -> Self {
        Self {
            host_salt,
            clock,
            state: Mutex::new(AllocatorState {
                counter: 0,
                window_millis: i64::MIN,
                issued: HashSet::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn host_salt(&self) -> &str {
        &self.host_salt
    }

    /// Generate a key for a post from `source`, which must be 5 ASCII characters.
    ///
    /// Within one millisecond the suffix is redrawn until the original key
    /// differs from every key already issued in that millisecond. When all
    /// suffixes are taken the call waits for the clock to move on.
    pub fn generate_id(&self, source: &str) -> Result<BucketedKey> {
        if source.len() != SOURCE_TAG_LEN || !source.is_ascii() {
            return Err(AppError::invalid_argument(format!(
                "source must be {SOURCE_TAG_LEN} ASCII characters, got {source:?}"
            )));
        }

        let mut state = self.state.lock();
        let original = loop {
            let now = (self.clock)();
            if now != state.window_millis {
                state.window_millis = now;
                state.issued.clear();
            }

            let prefix = format!(
                "{:0width$}{}{}",
                i64::MAX - now,
                source,
                self.host_salt,
                width = TIMESTAMP_WIDTH
            );

            if let Some(key) = Self::draw_unused(&mut state, &prefix) {
                break key;
            }

            log::debug!("row key suffixes exhausted for {source} at {now}, waiting for next ms");
            while (self.clock)() == now {
                std::thread::sleep(CLOCK_WAIT);
            }
        };

        state.issued.insert(original.clone());
        let bucket = state.counter;
        state.counter = (state.counter + 1) % BUCKET_COUNT;

        Ok(BucketedKey(format!(
            "{bucket:0width$}{original}",
            width = BUCKET_WIDTH
        )))
    }

    fn draw_unused(state: &mut AllocatorState, prefix: &str) -> Option<String> {
        for _ in 0..RANDOM_ATTEMPTS {
            let suffix = state.rng.random_range(SUFFIX_MIN..=SUFFIX_MAX);
            let key = format!("{prefix}{suffix}");
            if !state.issued.contains(&key) {
                return Some(key);
            }
        }
        (SUFFIX_MIN..=SUFFIX_MAX)
            .map(|suffix| format!("{prefix}{suffix}"))
            .find(|key| !state.issued.contains(key))
    }
}

impl Default for RowKeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// First four base64 characters of the SHA-256 digest of `host`.
pub fn host_salt(host: &str) -> String {
    let mut encoded = STANDARD.encode(Sha256::digest(host.as_bytes()));
    encoded.truncate(HOST_SALT_WIDTH);
    encoded
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "None".to_string())
}
