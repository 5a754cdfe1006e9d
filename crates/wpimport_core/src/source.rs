use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::{ImportConfig, join_api_base};
use crate::error::SourceError;
use crate::model::{ContentKind, SourceRecord};

/// WordPress caps `per_page` at 100.
pub const MAX_PAGE_SIZE: usize = 100;

/// Byte stream of one media file. Dropping it releases the underlying connection.
pub type MediaReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// One round trip for one page. `page` starts at 1; an empty page means the
    /// collection is exhausted.
    async fn fetch_page(
        &self,
        kind: ContentKind,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    fn request_count(&self) -> usize;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn open(&self, url: &str) -> Result<MediaReader, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub api_base: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl SourceClientConfig {
    pub fn from_config(config: &ImportConfig) -> Result<Self> {
        let Some(api_base) = config.api_base_url() else {
            bail!("no WordPress source configured; set [source] url or WP_SOURCE_URL");
        };
        Ok(Self {
            api_base,
            user_agent: config.user_agent(),
            timeout_ms: config.http_timeout_ms(),
        })
    }

    pub fn with_source_url(mut self, site_url: &str, api_path: &str) -> Self {
        self.api_base = join_api_base(site_url, api_path);
        self
    }
}

pub struct WordPressClient {
    client: Client,
    base_url: Url,
    request_count: AtomicUsize,
}

impl WordPressClient {
    pub fn new(config: &SourceClientConfig) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", config.api_base.trim_end_matches('/')))
            .with_context(|| format!("invalid WordPress API base: {}", config.api_base))?;
        Ok(Self {
            client: build_http_client(config)?,
            base_url,
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn collection_url(&self, kind: ContentKind) -> Result<Url, SourceError> {
        self.base_url.join(kind.collection()).map_err(|error| {
            SourceError::malformed(format!("cannot build {kind} collection URL: {error}"))
        })
    }
}

#[async_trait]
impl SourceClient for WordPressClient {
    async fn fetch_page(
        &self,
        kind: ContentKind,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        if page == 0 {
            return Err(SourceError::malformed(format!(
                "{kind} page numbers start at 1"
            )));
        }
        let per_page = clamp_page_size(page_size);
        let url = self.collection_url(kind)?;
        let context = format!("{kind} page {page}");

        self.request_count.fetch_add(1, Ordering::Relaxed);
        debug!("GET {url} per_page={per_page} page={page}");
        let response = self
            .client
            .get(url)
            .query(&[("per_page", per_page.to_string()), ("page", page.to_string())])
            .send()
            .await
            .map_err(|error| transport_error(&context, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::BAD_REQUEST && is_invalid_page_response(&body) {
                debug!("{context}: past the last page");
                return Ok(Vec::new());
            }
            return Err(SourceError::Unavailable {
                context: format!("{context}: HTTP {status}"),
                status: Some(status.as_u16()),
                timed_out: false,
            });
        }

        let payload: Value = response.json().await.map_err(|error| {
            if error.is_decode() {
                SourceError::malformed(format!("{context}: response is not JSON: {error}"))
            } else {
                transport_error(&context, &error)
            }
        })?;
        parse_page(kind, payload)
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

/// Streams media bodies over HTTP with the same client settings as the page fetcher.
pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    pub fn new(config: &SourceClientConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
        })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn open(&self, url: &str) -> Result<MediaReader, SourceError> {
        let parsed = Url::parse(url)
            .map_err(|error| SourceError::malformed(format!("invalid media URL {url}: {error}")))?;
        let context = format!("media {url}");
        debug!("GET {parsed}");
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|error| transport_error(&context, &error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable {
                context: format!("{context}: HTTP {status}"),
                status: Some(status.as_u16()),
                timed_out: false,
            });
        }
        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

/// Decode a page body into records. Anything but an array of objects with numeric ids is malformed.
pub fn parse_page(kind: ContentKind, payload: Value) -> Result<Vec<SourceRecord>, SourceError> {
    let Value::Array(items) = payload else {
        return Err(SourceError::malformed(format!(
            "{kind} page body is not a JSON array"
        )));
    };
    items
        .into_iter()
        .map(|item| SourceRecord::from_value(kind, item))
        .collect()
}

pub fn clamp_page_size(page_size: usize) -> usize {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

/// WordPress answers a page past the end with HTTP 400 and `rest_post_invalid_page_number`.
fn is_invalid_page_response(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(|payload| payload.get("code"))
        .and_then(Value::as_str)
        .is_some_and(|code| code.ends_with("_invalid_page_number"))
}

fn build_http_client(config: &SourceClientConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(config.timeout_ms))
        .user_agent(config.user_agent.clone())
        .build()
        .context("failed to build WordPress HTTP client")
}

fn transport_error(context: &str, error: &reqwest::Error) -> SourceError {
    SourceError::Unavailable {
        context: format!("{context}: {error}"),
        status: error.status().map(|status| status.as_u16()),
        timed_out: error.is_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn test_config() -> SourceClientConfig {
        SourceClientConfig {
            api_base: "https://blog.example.org/wp-json/wp/v2".to_string(),
            user_agent: "wpimport-test".to_string(),
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn parse_page_decodes_records_of_requested_kind() {
        let records = parse_page(
            ContentKind::Tag,
            json!([{"id": 1, "name": "rust"}, {"id": 2, "name": "tokio", "slug": "tokio"}]),
        )
        .expect("parse");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| record.kind() == ContentKind::Tag));
        assert_eq!(records[1].external_id(), 2);
    }

    #[test]
    fn parse_page_rejects_non_array_body() {
        let error = parse_page(ContentKind::Post, json!({"code": "oops"})).expect_err("must fail");
        assert!(matches!(error, SourceError::Malformed { .. }));
    }

    #[test]
    fn parse_page_rejects_items_without_numeric_id() {
        let error = parse_page(ContentKind::Category, json!([{"id": 1}, {"id": "two"}]))
            .expect_err("must fail");
        assert!(!error.is_retryable());
    }

    #[test]
    fn invalid_page_number_body_is_detected() {
        assert!(is_invalid_page_response(
            r#"{"code":"rest_post_invalid_page_number","message":"The page number requested is larger than the number of pages available.","data":{"status":400}}"#
        ));
        assert!(is_invalid_page_response(
            r#"{"code":"rest_term_invalid_page_number"}"#
        ));
        assert!(!is_invalid_page_response(r#"{"code":"rest_invalid_param"}"#));
        assert!(!is_invalid_page_response("<html>bad request</html>"));
    }

    #[test]
    fn page_size_is_clamped_to_wordpress_limits() {
        assert_eq!(clamp_page_size(0), 1);
        assert_eq!(clamp_page_size(25), 25);
        assert_eq!(clamp_page_size(500), MAX_PAGE_SIZE);
    }

    #[test]
    fn collection_urls_follow_api_base() {
        let client = WordPressClient::new(&test_config()).expect("client");
        assert_eq!(
            client
                .collection_url(ContentKind::Author)
                .expect("url")
                .as_str(),
            "https://blog.example.org/wp-json/wp/v2/users"
        );
        assert_eq!(
            client
                .collection_url(ContentKind::Post)
                .expect("url")
                .as_str(),
            "https://blog.example.org/wp-json/wp/v2/posts"
        );
    }

    #[test]
    fn config_requires_a_source_url() {
        let error = SourceClientConfig::from_config(&ImportConfig::default());
        if std::env::var("WP_SOURCE_URL").is_err() {
            assert!(error.is_err());
        }
        let config = test_config().with_source_url("https://other.test/", "/wp-json/wp/v2");
        assert_eq!(config.api_base, "https://other.test/wp-json/wp/v2");
    }

    #[tokio::test]
    async fn page_zero_is_rejected_without_a_request() {
        let client = WordPressClient::new(&test_config()).expect("client");
        let error = client
            .fetch_page(ContentKind::Post, 0, 10)
            .await
            .expect_err("must fail");
        assert!(matches!(error, SourceError::Malformed { .. }));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn media_fetcher_rejects_invalid_urls() {
        let fetcher = HttpMediaFetcher::new(&test_config()).expect("fetcher");
        let result = fetcher.open("not a url").await;
        assert!(matches!(result, Err(SourceError::Malformed { .. })));
    }
}
