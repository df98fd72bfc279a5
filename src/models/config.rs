//! Application configuration structures.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::SourceTag;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Worker counts, buffering and time budget
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Search terms per language; the configured languages are the keys
    #[serde(default)]
    pub terms: BTreeMap<String, Vec<String>>,

    /// Streaming and polling endpoints
    #[serde(default)]
    pub source: SourceConfig,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a TOML file, merging any term files it lists.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for file in config.harvest.term_files.clone() {
            let term_path = base.join(&file);
            let content = fs::read_to_string(&term_path).map_err(|e| {
                AppError::config(format!("Cannot read term file {}: {e}", term_path.display()))
            })?;
            let term_file: TermFile = toml::from_str(&content)?;
            config
                .terms
                .entry(term_file.lang)
                .or_default()
                .extend(term_file.terms);
        }

        let mut terms: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (lang, lang_terms) in std::mem::take(&mut config.terms) {
            terms.entry(lang.to_lowercase()).or_default().extend(lang_terms);
        }
        config.terms = terms;

        Ok(config)
    }

    /// Configured target languages, in a stable order.
    pub fn languages(&self) -> Vec<String> {
        self.terms.keys().cloned().collect()
    }

    /// The validated source tag stamped on every harvested post.
    pub fn source_tag(&self) -> Result<SourceTag> {
        SourceTag::new(self.harvest.source_tag.clone())
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        self.source_tag()
            .map_err(|e| AppError::validation(format!("harvest.source_tag: {e}")))?;

        if self.harvest.buffer_size == 0 {
            return Err(AppError::validation("harvest.buffer_size must be > 0"));
        }
        if self.terms.is_empty() {
            return Err(AppError::validation("No languages defined in [terms]"));
        }
        if !self.harvest.streaming && self.harvest.workers == 0 {
            return Err(AppError::validation(
                "Nothing to run: streaming is disabled and harvest.workers is 0",
            ));
        }
        if self.harvest.workers > 0 {
            if self.source.search_url.is_none() {
                return Err(AppError::validation(
                    "source.search_url is required when harvest.workers > 0",
                ));
            }
            if self.terms.values().all(|terms| terms.is_empty()) {
                return Err(AppError::validation("No search terms defined"));
            }
        }
        if self.harvest.streaming && self.source.stream_url.is_none() {
            return Err(AppError::validation(
                "source.stream_url is required when streaming is enabled",
            ));
        }
        if self.source.timeout_secs == 0 {
            return Err(AppError::validation("source.timeout_secs must be > 0"));
        }

        let tiered = &self.storage.tiered;
        if self.storage.backend == BackendKind::Tiered
            && (tiered.primary_family.trim().is_empty()
                || tiered.secondary_family.trim().is_empty())
        {
            return Err(AppError::validation("Column family names must not be empty"));
        }
        Ok(())
    }
}

/// Harvesting behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Number of polling workers (0 disables polling)
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Whether the streaming worker runs
    #[serde(default = "defaults::streaming")]
    pub streaming: bool,

    /// Sleep between poll calls, in seconds
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_secs: u64,

    /// Buffer occupancy that triggers a flush
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Time budget in minutes (0 = run until cancelled)
    #[serde(default)]
    pub minutes: u64,

    /// Five-character tag identifying the source system
    #[serde(default = "defaults::source_tag")]
    pub source_tag: String,

    /// Log buffer progress every N accepted posts
    #[serde(default = "defaults::progress_every")]
    pub progress_every: usize,

    /// Extra term files (`lang = "xx"`, `terms = [..]`), relative to the config file
    #[serde(default)]
    pub term_files: Vec<PathBuf>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            streaming: defaults::streaming(),
            poll_interval_secs: defaults::poll_interval(),
            buffer_size: defaults::buffer_size(),
            minutes: 0,
            source_tag: defaults::source_tag(),
            progress_every: defaults::progress_every(),
            term_files: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TermFile {
    lang: String,
    #[serde(default)]
    terms: Vec<String>,
}

/// Ingestion source endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Polling search endpoint
    #[serde(default)]
    pub search_url: Option<String>,

    /// Newline-delimited JSON streaming endpoint
    #[serde(default)]
    pub stream_url: Option<String>,

    /// Bearer token sent with every request
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Request timeout in seconds (polling only)
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Results requested per poll
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            stream_url: None,
            bearer_token: None,
            timeout_secs: defaults::timeout(),
            page_size: defaults::page_size(),
            user_agent: defaults::user_agent(),
        }
    }
}

/// Which storage backend receives flushed buffers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Fast dedup tier + durable wide-column tier
    #[default]
    Tiered,
    /// Single flat JSON file, no dedup ledger
    File,
}

/// Which wide-column table implementation backs the durable tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DurableKind {
    #[default]
    Local,
    Memory,
}

/// Storage backend selection and connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub tiered: TieredConfig,

    #[serde(default)]
    pub file: FileConfig,
}

/// Tiered backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredConfig {
    /// Dedup markers live in `{prefix}{source}`
    #[serde(default = "defaults::dedup_namespace_prefix")]
    pub dedup_namespace_prefix: String,

    #[serde(default = "defaults::dedup_set")]
    pub dedup_set: String,

    /// Handoff queue namespace for the downstream stage
    #[serde(default = "defaults::handoff_namespace")]
    pub handoff_namespace: String,

    #[serde(default = "defaults::handoff_set")]
    pub handoff_set: String,

    #[serde(default)]
    pub durable: DurableKind,

    /// Root directory of the local durable table
    #[serde(default = "defaults::durable_root")]
    pub durable_root: PathBuf,

    #[serde(default = "defaults::table")]
    pub table: String,

    #[serde(default = "defaults::primary_family")]
    pub primary_family: String,

    #[serde(default = "defaults::secondary_family")]
    pub secondary_family: String,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self {
            dedup_namespace_prefix: defaults::dedup_namespace_prefix(),
            dedup_set: defaults::dedup_set(),
            handoff_namespace: defaults::handoff_namespace(),
            handoff_set: defaults::handoff_set(),
            durable: DurableKind::default(),
            durable_root: defaults::durable_root(),
            table: defaults::table(),
            primary_family: defaults::primary_family(),
            secondary_family: defaults::secondary_family(),
        }
    }
}

/// Flat-file backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "defaults::file_path")]
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: defaults::file_path(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Harvest defaults
    pub fn workers() -> usize {
        1
    }
    pub fn streaming() -> bool {
        true
    }
    pub fn poll_interval() -> u64 {
        5
    }
    pub fn buffer_size() -> usize {
        10_000
    }
    pub fn source_tag() -> String {
        "twttr".into()
    }
    pub fn progress_every() -> usize {
        50
    }

    // Source defaults
    pub fn timeout() -> u64 {
        30
    }
    pub fn page_size() -> usize {
        100
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; harvester/0.1)".into()
    }

    // Storage defaults
    pub fn dedup_namespace_prefix() -> String {
        "ingest_".into()
    }
    pub fn dedup_set() -> String {
        "ids".into()
    }
    pub fn handoff_namespace() -> String {
        "ingest_classifier".into()
    }
    pub fn handoff_set() -> String {
        "input_buffer".into()
    }
    pub fn durable_root() -> PathBuf {
        PathBuf::from("data/durable")
    }
    pub fn table() -> String {
        "posts".into()
    }
    pub fn primary_family() -> String {
        "p".into()
    }
    pub fn secondary_family() -> String {
        "s".into()
    }
    pub fn file_path() -> PathBuf {
        PathBuf::from("data/posts.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config
            .terms
            .insert("en".into(), vec!["rust".into(), "tokio".into()]);
        config.source.search_url = Some("http://localhost/search".into());
        config.source.stream_url = Some("http://localhost/stream".into());
        config
    }

    #[test]
    fn validate_valid_config_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_source_tag() {
        let mut config = valid_config();
        config.harvest.source_tag = "twitter".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_buffer() {
        let mut config = valid_config();
        config.harvest.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_nothing_to_run() {
        let mut config = valid_config();
        config.harvest.streaming = false;
        config.harvest.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_endpoints() {
        let mut config = valid_config();
        config.source.stream_url = None;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.source.search_url = None;
        assert!(config.validate().is_err());

        config.harvest.workers = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_merges_term_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("gl.toml"),
            "lang = \"GL\"\nterms = [\"ola\", \"grazas\"]\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("harvester.toml"),
            r#"
[harvest]
workers = 3
minutes = 10
term_files = ["gl.toml"]

[terms]
en = ["rust"]

[storage]
backend = "file"
"#,
        )
        .unwrap();

        let config = Config::load(tmp.path().join("harvester.toml")).unwrap();
        assert_eq!(config.harvest.workers, 3);
        assert_eq!(config.harvest.minutes, 10);
        assert_eq!(config.harvest.buffer_size, 10_000);
        assert_eq!(config.languages(), vec!["en".to_string(), "gl".to_string()]);
        assert_eq!(config.terms["gl"], vec!["ola", "grazas"]);
        assert_eq!(config.storage.backend, BackendKind::File);
        assert_eq!(config.storage.tiered.dedup_namespace_prefix, "ingest_");
    }

    #[test]
    fn load_fails_on_missing_term_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("harvester.toml");
        std::fs::write(&path, "[harvest]\nterm_files = [\"missing.toml\"]\n").unwrap();
        assert!(matches!(Config::load(&path), Err(AppError::Config(_))));
    }
}
