//! Streaming source client.
//!
//! The endpoint answers with newline-delimited JSON. Lines that do not
//! decode as a post (keep-alives, deletion notices) are skipped.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{RawPost, SourceConfig};
use crate::services::create_client;

/// A push source of posts. `None` means the stream has ended.
#[async_trait]
pub trait PostStream: Send {
    async fn next_post(&mut self) -> Result<Option<RawPost>>;
}

/// Splits a byte stream into lines and decodes posts from them.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete post, skipping lines that are not posts.
    pub fn next_post(&mut self) -> Option<RawPost> {
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(post) = decode_line(&line) {
                return Some(post);
            }
        }
        None
    }

    /// Decode whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<RawPost> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Option<RawPost> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(post) => Some(post),
        Err(e) => {
            log::debug!("Skipping stream line: {e}");
            None
        }
    }
}

/// Streaming endpoint over HTTP.
pub struct HttpPostStream {
    client: Client,
    url: Url,
    bearer_token: Option<String>,
    body: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    decoder: LineDecoder,
    ended: bool,
}

impl HttpPostStream {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let url = source
            .stream_url
            .as_deref()
            .ok_or_else(|| AppError::config("source.stream_url is not set"))?;
        Ok(Self {
            client: create_client(source, None)?,
            url: Url::parse(url)?,
            bearer_token: source.bearer_token.clone(),
            body: None,
            decoder: LineDecoder::new(),
            ended: false,
        })
    }

    async fn open(
        client: Client,
        url: Url,
        bearer_token: Option<String>,
    ) -> Result<BoxStream<'static, reqwest::Result<Vec<u8>>>> {
        let mut request = client.get(url.clone());
        if let Some(token) = &bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        log::info!("Subscribed to {url}");
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed())
    }
}

#[async_trait]
impl PostStream for HttpPostStream {
    async fn next_post(&mut self) -> Result<Option<RawPost>> {
        loop {
            if let Some(post) = self.decoder.next_post() {
                return Ok(Some(post));
            }
            if self.ended {
                return Ok(None);
            }

            let chunk = match self.body.as_mut() {
                Some(body) => body.next().await,
                None => {
                    let body = Self::open(
                        self.client.clone(),
                        self.url.clone(),
                        self.bearer_token.clone(),
                    )
                    .await?;
                    self.body = Some(body);
                    continue;
                }
            };

            match chunk {
                Some(Ok(bytes)) => self.decoder.push(&bytes),
                Some(Err(e)) => {
                    self.body = None;
                    return Err(AppError::ingest(self.url.as_str(), e));
                }
                None => {
                    log::info!("Stream {} closed", self.url);
                    self.body = None;
                    self.ended = true;
                    return Ok(self.decoder.finish());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST: &str = r#"{"id":1,"text":"a","lang":"en","created_at":"2024-01-01T00:00:00Z","user":{"id":2,"name":"N","screen_name":"n"}}"#;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = LineDecoder::new();
        let (head, tail) = POST.split_at(20);

        decoder.push(head.as_bytes());
        assert!(decoder.next_post().is_none());

        decoder.push(tail.as_bytes());
        decoder.push(b"\n");
        assert_eq!(decoder.next_post().map(|p| p.id), Some(1));
        assert!(decoder.next_post().is_none());
    }

    #[test]
    fn test_decoder_skips_noise() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"\r\n");
        decoder.push(br#"{"delete":{"status":{"id":9}}}"#);
        decoder.push(b"\n");
        decoder.push(POST.as_bytes());
        decoder.push(b"\r\n");

        assert_eq!(decoder.next_post().map(|p| p.id), Some(1));
        assert!(decoder.next_post().is_none());
    }

    #[test]
    fn test_decoder_finish() {
        let mut decoder = LineDecoder::new();
        decoder.push(POST.as_bytes());
        assert!(decoder.next_post().is_none());
        assert_eq!(decoder.finish().map(|p| p.id), Some(1));
        assert!(decoder.finish().is_none());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_refused_subscription_leaves_stream_reopenable() {
        let source = SourceConfig {
            stream_url: Some("http://127.0.0.1:1/stream".into()),
            timeout_secs: 1,
            ..SourceConfig::default()
        };
        let mut stream = HttpPostStream::new(&source).unwrap();

        let read = stream.next_post();
        assert_send(&read);
        assert!(read.await.is_err());
        assert!(stream.body.is_none());
        assert!(!stream.ended);
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let result = HttpPostStream::new(&SourceConfig::default());
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
