//! Polling search client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{RawPost, SourceConfig};
use crate::services::create_client;

/// One poll: a language and the terms assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub language: String,
    pub terms: Vec<String>,
    pub count: usize,
}

impl SearchQuery {
    /// Terms joined into a single disjunctive query.
    pub fn text(&self) -> String {
        self.terms.join(" OR ")
    }
}

/// Anything that answers a term query with a finite page of posts.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawPost>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    statuses: Vec<RawPost>,
}

/// Search endpoint over HTTP: `GET {search_url}?q=..&lang=..&count=..`.
pub struct HttpSearchClient {
    client: Client,
    url: Url,
    bearer_token: Option<String>,
}

impl HttpSearchClient {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let url = source
            .search_url
            .as_deref()
            .ok_or_else(|| AppError::config("source.search_url is not set"))?;
        Ok(Self {
            client: create_client(source, Some(Duration::from_secs(source.timeout_secs)))?,
            url: Url::parse(url)?,
            bearer_token: source.bearer_token.clone(),
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawPost>> {
        let mut request = self.client.get(self.url.clone()).query(&[
            ("q", query.text()),
            ("lang", query.language.clone()),
            ("count", query.count.to_string()),
        ]);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?.error_for_status()?;
        let body: SearchResponse = response.json().await?;
        log::debug!(
            "Search [{}] {:?} returned {} posts",
            query.language,
            query.text(),
            body.statuses.len()
        );
        Ok(body.statuses)
    }
}
