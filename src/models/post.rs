//! Post data structures.
//!
//! [`RawPost`] is what an ingestion source hands over; [`Post`] is the
//! immutable record the buffers, the gateway and the stores work with.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Width of a source tag.
pub const SOURCE_TAG_LEN: usize = 5;

/// Fixed-length code identifying the producing system (e.g. `twttr`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceTag(String);

impl SourceTag {
    /// Validate and wrap a source tag. Tags are ASCII so row key offsets stay byte offsets.
    pub fn new(tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        if tag.len() != SOURCE_TAG_LEN || !tag.is_ascii() {
            return Err(AppError::invalid_argument(format!(
                "source tag must be {SOURCE_TAG_LEN} ASCII characters, got {tag:?}"
            )));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SourceTag {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SourceTag> for String {
    fn from(tag: SourceTag) -> Self {
        tag.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author block of a raw event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawAuthor {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub screen_name: String,
}

/// A post event as produced by the streaming or polling source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawPost {
    pub id: u64,
    pub text: String,
    #[serde(default)]
    pub lang: String,
    pub created_at: DateTime<Utc>,
    pub user: RawAuthor,
}

/// A harvested post. Immutable once constructed; `post_id` is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub source: SourceTag,
    pub language: String,
    pub content: String,
    pub author_name: String,
    pub author_nickname: String,
    pub author_id: String,
    pub post_id: String,
    /// Milliseconds since epoch, string-encoded
    pub publication_timestamp: String,
    #[serde(default)]
    pub relevance: Option<f64>,
}

impl Post {
    /// Map a raw source event onto the storage model.
    pub fn from_raw(source: &SourceTag, raw: RawPost) -> Self {
        let mut post = Self {
            source: source.clone(),
            language: raw.lang.to_lowercase(),
            content: raw.text,
            author_name: raw.user.name,
            author_nickname: raw.user.screen_name,
            author_id: raw.user.id.to_string(),
            post_id: raw.id.to_string(),
            publication_timestamp: raw.created_at.timestamp_millis().to_string(),
            relevance: None,
        };
        post.relevance = relevance(&post);
        post
    }
}

/// Relevance scoring hook. Scoring is not implemented; every post is unscored.
pub fn relevance(_post: &Post) -> Option<f64> {
    None
}

#[cfg(test)]
pub(crate) fn sample_post(post_id: &str, language: &str) -> Post {
    Post {
        source: SourceTag::new("twttr").unwrap(),
        language: language.to_string(),
        content: format!("content of {post_id}"),
        author_name: "Jane Doe".to_string(),
        author_nickname: "jdoe".to_string(),
        author_id: "42".to_string(),
        post_id: post_id.to_string(),
        publication_timestamp: "1700000000000".to_string(),
        relevance: None,
    }
}
