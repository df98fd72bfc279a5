//! Flat-file storage implementation.
//!
//! Every flushed post is merged into one JSON document keyed by post id.
//! There is no fast tier: duplicates are detected against the document
//! itself, and the first stored copy of a post wins.
//!
//! ## Storage Layout
//!
//! ```text
//! {path}                 # e.g. data/posts.json
//! {path}.tmp             # transient, renamed over {path} on every write
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::Post;
use crate::storage::{DumpSummary, PostStorage};

static LINE_BREAKS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[\r\n]+").ok());

/// Remove line breaks so each stored body is a single line.
fn strip_line_breaks(content: &str) -> String {
    match LINE_BREAKS.as_ref() {
        Some(re) => re.replace_all(content, "").into_owned(),
        None => content.replace(['\r', '\n'], ""),
    }
}

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDocument {
    /// ISO 8601 timestamp of last update
    pub updated_at: DateTime<Utc>,
    /// Total post count
    pub count: usize,
    /// Posts by post id
    pub posts: BTreeMap<String, Post>,
}

impl PostDocument {
    fn new(posts: BTreeMap<String, Post>) -> Self {
        Self {
            updated_at: Utc::now(),
            count: posts.len(),
            posts,
        }
    }
}

/// Local filesystem storage backend.
pub struct LocalStorage {
    path: PathBuf,
    // serialises dumps across workers
    lock: Mutex<()>,
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Load the stored document, `None` if nothing was written yet.
    pub async fn load(&self) -> Result<Option<PostDocument>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn merge(&self, posts: Vec<Post>, summary: &mut DumpSummary) -> Result<()> {
        let mut stored = self.load().await?.map(|doc| doc.posts).unwrap_or_default();

        for mut post in posts {
            if stored.contains_key(&post.post_id) {
                summary.already_ingested += 1;
                continue;
            }
            post.content = strip_line_breaks(&post.content);
            stored.insert(post.post_id.clone(), post);
            summary.new += 1;
        }

        if summary.new == 0 {
            return Ok(());
        }
        let document = PostDocument::new(stored);
        let bytes = serde_json::to_vec_pretty(&document)?;
        self.write_bytes(&bytes).await?;
        log::info!(
            "{} posts written to {} ({} total)",
            summary.new,
            self.path.display(),
            document.count
        );
        Ok(())
    }
}

#[async_trait]
impl PostStorage for LocalStorage {
    async fn connect(&self) -> Result<()> {
        self.ensure_dir()
            .await
            .map_err(|e| AppError::connection("file", format!("{}: {e}", self.path.display())))?;
        log::info!("Writing posts to {}", self.path.display());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn dump(&self, posts: Vec<Post>) -> DumpSummary {
        let _guard = self.lock.lock().await;
        let mut summary = DumpSummary {
            received: posts.len(),
            ..DumpSummary::default()
        };

        match self.merge(posts, &mut summary).await {
            Ok(()) => summary.durable_written = summary.new,
            Err(e) => {
                log::error!("Writing {} failed: {e}", self.path.display());
                summary.durable_lost = summary.new;
            }
        }
        summary
    }
}
