//! Ingestion source clients.
//!
//! - Polling search (`HttpSearchClient`)
//! - Newline-delimited JSON stream (`HttpPostStream`)

mod search;
mod stream;

use std::time::Duration;

use reqwest::Client;

use crate::error::Result;
use crate::models::SourceConfig;

pub use search::{HttpSearchClient, SearchClient, SearchQuery};
pub use stream::{HttpPostStream, LineDecoder, PostStream};

/// Create a configured HTTP client. `timeout` bounds whole requests;
/// long-lived streams pass `None` and only bound the connect phase.
pub fn create_client(source: &SourceConfig, timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(&source.user_agent)
        .connect_timeout(Duration::from_secs(source.timeout_secs));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}
