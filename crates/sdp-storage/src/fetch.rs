//! Paginated retrieval of submissions from the forms API.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sdp_core::{PipelineError, RawRecord};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const DEFAULT_PAGE_SIZE: usize = 2000;

/// Feed account. The key never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    api_key: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Query-parameter dialect used to page through the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaginationStyle {
    /// `$top` / `$skip`
    #[default]
    OData,
    /// `limit` / `offset`
    LimitOffset,
}

impl PaginationStyle {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "odata" => Some(PaginationStyle::OData),
            "limit-offset" | "limit_offset" | "offset" => Some(PaginationStyle::LimitOffset),
            _ => None,
        }
    }

    pub fn query_params(&self, offset: usize, limit: usize) -> [(&'static str, String); 2] {
        match self {
            PaginationStyle::OData => [("$top", limit.to_string()), ("$skip", offset.to_string())],
            PaginationStyle::LimitOffset => {
                [("limit", limit.to_string()), ("offset", offset.to_string())]
            }
        }
    }
}

/// Project/form coordinates of the submissions feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEndpoint {
    pub base_url: String,
    pub project_id: String,
    pub form_id: String,
}

impl FeedEndpoint {
    pub fn submissions_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/forms/{}.svc/Submissions",
            self.base_url.trim_end_matches('/'),
            self.project_id,
            self.form_id
        )
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("credentials rejected with http {status} for {url}")]
    Authentication { status: u16, url: String },
    #[error("request timed out: {message}")]
    Timeout { message: String },
    #[error("connection failed: {message}")]
    Connection { message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable feed page: {message}")]
    Decode { message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

impl FetchError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_request() || err.is_body() {
            FetchError::Connection {
                message: err.to_string(),
            }
        } else {
            FetchError::Request(err)
        }
    }

    /// A failure while streaming an accepted response body is a transport failure.
    pub fn from_body_read(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                message: err.to_string(),
            }
        } else {
            FetchError::Connection {
                message: err.to_string(),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connection { .. } => true,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Authentication { .. } | FetchError::Decode { .. } | FetchError::Request(_) => {
                false
            }
        }
    }
}

/// A failed pagination run. `partial` holds whatever arrived before the failure
/// and is never handed out as a successful result.
#[derive(Debug, Error)]
#[error("pagination stopped after {pages_fetched} pages ({} records): {error}", .partial.len())]
pub struct FetchAllError {
    #[source]
    pub error: FetchError,
    pub partial: Vec<RawRecord>,
    pub pages_fetched: usize,
}

impl From<FetchAllError> for PipelineError {
    fn from(err: FetchAllError) -> Self {
        let records_fetched = err.partial.len();
        match err.error {
            FetchError::Authentication { status, .. } => {
                PipelineError::AuthenticationFailure { status }
            }
            FetchError::Timeout { message } | FetchError::Connection { message } => {
                PipelineError::TransientNetworkFailure { message }
            }
            FetchError::HttpStatus { status, .. } => PipelineError::UpstreamServerError {
                status,
                records_fetched,
            },
            FetchError::Decode { message } => PipelineError::MalformedFeed { message },
            FetchError::Request(err) => PipelineError::InvalidRequest {
                message: err.to_string(),
            },
        }
    }
}

/// One page of records at a given offset.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawRecord>, FetchError>;
}

/// Walk the feed from offset 0 until a short or empty page.
///
/// A total that is an exact multiple of `page_size` costs one extra empty request.
pub async fn fetch_all<S>(source: &S, page_size: usize) -> Result<Vec<RawRecord>, FetchAllError>
where
    S: PageSource + ?Sized,
{
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut pages_fetched = 0usize;

    loop {
        let page = match source.fetch_page(offset, page_size).await {
            Ok(page) => page,
            Err(error) => {
                warn!(offset, pages_fetched, error = %error, "pagination aborted");
                return Err(FetchAllError {
                    error,
                    partial: records,
                    pages_fetched,
                });
            }
        };
        pages_fetched += 1;

        let received = page.len();
        debug!(offset, received, "page received");
        records.extend(page);

        if received < page_size {
            break;
        }
        offset += received;
    }

    info!(pages_fetched, records = records.len(), "pagination complete");
    Ok(records)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Basic-auth JSON feed reached over reqwest.
#[derive(Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
    url: String,
    credentials: Credentials,
    pagination: PaginationStyle,
    backoff: BackoffPolicy,
}

impl HttpPageSource {
    pub fn new(
        url: impl Into<String>,
        credentials: Credentials,
        pagination: PaginationStyle,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
            credentials,
            pagination,
            backoff: config.backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request_page(&self, offset: usize, limit: usize) -> Result<Vec<RawRecord>, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .basic_auth(&self.credentials.username, Some(self.credentials.api_key()))
            .query(&self.pagination.query_params(offset, limit))
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = resp.status();
        if is_auth_status(status) {
            return Err(FetchError::Authentication {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        let bytes = resp.bytes().await.map_err(FetchError::from_body_read)?;
        let body: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
                message: err.to_string(),
            })?;
        extract_records(body)
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!("page_fetch", url = %self.url, offset, limit);
        async {
            let mut attempt = 0usize;
            loop {
                match self.request_page(offset, limit).await {
                    Ok(records) => return Ok(records),
                    Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(attempt, ?delay, error = %err, "retrying page request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Pull the record array out of a page body: `{"value": [...]}`, `{"results": [...]}`
/// or a bare array.
pub fn extract_records(body: serde_json::Value) -> Result<Vec<RawRecord>, FetchError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map
            .remove("value")
            .or_else(|| map.remove("results"))
        {
            Some(serde_json::Value::Array(items)) => items,
            Some(other) => {
                return Err(FetchError::Decode {
                    message: format!("record list is {} instead of an array", json_kind(&other)),
                })
            }
            None => {
                return Err(FetchError::Decode {
                    message: "page body has no `value` array".to_string(),
                })
            }
        },
        other => {
            return Err(FetchError::Decode {
                message: format!("page body is {}", json_kind(&other)),
            })
        }
    };

    items
        .into_iter()
        .map(|item| match item {
            serde_json::Value::Object(fields) => Ok(fields.into_iter().collect::<RawRecord>()),
            other => Err(FetchError::Decode {
                message: format!("record is {} instead of an object", json_kind(&other)),
            }),
        })
        .collect()
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::{Query, State};
    use axum::http::{header, HeaderMap};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn record(id: usize) -> RawRecord {
        let mut r = RawRecord::new();
        r.insert("__id".into(), json!(format!("uuid:{id}")));
        r
    }

    /// Serves pre-scripted pages and records the offsets it was asked for.
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<Vec<RawRecord>, FetchError>>>,
        offsets: Mutex<Vec<usize>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<Vec<RawRecord>, FetchError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                offsets: Mutex::new(Vec::new()),
            }
        }

        fn sized(sizes: &[usize]) -> Self {
            let mut next = 0;
            let pages = sizes
                .iter()
                .map(|n| {
                    let page = (next..next + n).map(record).collect();
                    next += n;
                    Ok(page)
                })
                .collect();
            Self::new(pages)
        }

        fn requests(&self) -> Vec<usize> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, offset: usize, _limit: usize) -> Result<Vec<RawRecord>, FetchError> {
            self.offsets.lock().unwrap().push(offset);
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected request at offset {offset}"))
        }
    }

    #[tokio::test]
    async fn exact_multiple_issues_one_trailing_empty_request() {
        let source = ScriptedSource::sized(&[2, 2, 0]);
        let records = fetch_all(&source, 2).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(source.requests(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn two_records_then_empty_page() {
        let source = ScriptedSource::sized(&[2, 0]);
        let records = fetch_all(&source, 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(source.requests().len(), 2);
    }

    #[tokio::test]
    async fn short_page_terminates_without_extra_request() {
        let source = ScriptedSource::sized(&[3, 3, 1]);
        let records = fetch_all(&source, 3).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r["__id"].clone()).collect();
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[0], json!("uuid:0"));
        assert_eq!(ids[6], json!("uuid:6"));
        assert_eq!(source.requests(), vec![0, 3, 6]);
    }

    #[tokio::test]
    async fn request_count_matches_ceiling_rule() {
        for total in [0usize, 1, 5, 6, 11, 12] {
            let page_size = 3;
            let mut sizes = vec![page_size; total / page_size];
            sizes.push(total % page_size);
            let source = ScriptedSource::sized(&sizes);
            let records = fetch_all(&source, page_size).await.unwrap();
            assert_eq!(records.len(), total);
            let expected = if total % page_size == 0 {
                total / page_size + 1
            } else {
                total.div_ceil(page_size)
            };
            assert_eq!(source.requests().len(), expected, "total={total}");
        }
    }

    #[tokio::test]
    async fn failed_page_surfaces_partial_as_error() {
        let source = ScriptedSource::new(vec![
            Ok(vec![record(0), record(1)]),
            Err(FetchError::HttpStatus {
                status: 502,
                url: "http://feed".into(),
            }),
        ]);
        let err = fetch_all(&source, 2).await.unwrap_err();
        assert_eq!(err.partial.len(), 2);
        assert_eq!(err.pages_fetched, 1);
        assert!(err.error.is_retryable());

        let pipeline: PipelineError = err.into();
        assert!(matches!(
            pipeline,
            PipelineError::UpstreamServerError {
                status: 502,
                records_fetched: 2
            }
        ));
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let creds = Credentials::new("enumerator-bot", "s3cret-key");
        let text = format!("{creds:?}");
        assert!(text.contains("enumerator-bot"));
        assert!(!text.contains("s3cret-key"));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert!(is_auth_status(StatusCode::UNAUTHORIZED));
        assert!(!FetchError::Authentication {
            status: 401,
            url: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn extract_records_accepts_value_results_and_bare_arrays() {
        assert_eq!(extract_records(json!({"value": [{"a": 1}]})).unwrap().len(), 1);
        assert_eq!(extract_records(json!({"results": [{"a": 1}, {"b": 2}]})).unwrap().len(), 2);
        assert_eq!(extract_records(json!([])).unwrap().len(), 0);
        assert!(matches!(
            extract_records(json!({"count": 3})),
            Err(FetchError::Decode { .. })
        ));
        assert!(matches!(
            extract_records(json!({"value": [1, 2]})),
            Err(FetchError::Decode { .. })
        ));
    }

    #[test]
    fn odata_and_limit_offset_params() {
        assert_eq!(
            PaginationStyle::OData.query_params(4000, 2000),
            [("$top", "2000".to_string()), ("$skip", "4000".to_string())]
        );
        assert_eq!(
            PaginationStyle::LimitOffset.query_params(0, 10),
            [("limit", "10".to_string()), ("offset", "0".to_string())]
        );
        assert_eq!(PaginationStyle::parse("limit-offset"), Some(PaginationStyle::LimitOffset));
        assert_eq!(PaginationStyle::parse("xml"), None);
    }

    #[test]
    fn endpoint_builds_odata_submissions_url() {
        let endpoint = FeedEndpoint {
            base_url: "https://central.example.org/".into(),
            project_id: "7".into(),
            form_id: "tree_survey".into(),
        };
        assert_eq!(
            endpoint.submissions_url(),
            "https://central.example.org/v1/projects/7/forms/tree_survey.svc/Submissions"
        );
    }

    // base64("enumerator-bot:s3cret-key")
    const EXPECTED_AUTH: &str = "Basic ZW51bWVyYXRvci1ib3Q6czNjcmV0LWtleQ==";

    #[derive(Clone)]
    struct FeedState {
        total: usize,
        hits: Arc<AtomicUsize>,
        delay: Duration,
    }

    async fn submissions(
        State(state): State<FeedState>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        state.hits.fetch_add(1, Ordering::SeqCst);
        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(EXPECTED_AUTH);
        if !authorized {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
        let top: usize = query.get("$top").and_then(|v| v.parse().ok()).unwrap_or(0);
        let skip: usize = query.get("$skip").and_then(|v| v.parse().ok()).unwrap_or(0);
        let value: Vec<_> = (skip..state.total.min(skip + top))
            .map(|i| json!({"__id": format!("uuid:{i}"), "consent": 1}))
            .collect();
        Json(json!({ "value": value })).into_response()
    }

    async fn spawn_feed(total: usize, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/Submissions", get(submissions))
            .with_state(FeedState {
                total,
                hits: hits.clone(),
                delay,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn http_source(addr: SocketAddr, key: &str, timeout: Duration) -> HttpPageSource {
        HttpPageSource::new(
            format!("http://{addr}/Submissions"),
            Credentials::new("enumerator-bot", key),
            PaginationStyle::OData,
            HttpClientConfig {
                timeout,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn http_source_pages_through_odata_feed() {
        let (addr, hits) = spawn_feed(5, Duration::ZERO).await;
        let source = http_source(addr, "s3cret-key", Duration::from_secs(5));
        let records = fetch_all(&source, 2).await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[4]["__id"], json!("uuid:4"));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn http_source_reports_rejected_credentials() {
        let (addr, _hits) = spawn_feed(5, Duration::ZERO).await;
        let source = http_source(addr, "wrong", Duration::from_secs(5));
        let err = fetch_all(&source, 2).await.unwrap_err();
        assert!(matches!(err.error, FetchError::Authentication { status: 401, .. }));
        assert!(err.partial.is_empty());
        assert!(!format!("{err}").contains("wrong"));
    }

    #[tokio::test]
    async fn http_source_times_out_as_transient_failure() {
        let (addr, _hits) = spawn_feed(5, Duration::from_secs(3)).await;
        let source = http_source(addr, "s3cret-key", Duration::from_millis(200));
        let err = fetch_all(&source, 2).await.unwrap_err();
        assert!(matches!(err.error, FetchError::Timeout { .. }));
        assert!(err.error.is_retryable());
        let pipeline: PipelineError = err.into();
        assert!(pipeline.is_retryable());
    }

    #[tokio::test]
    async fn cut_off_body_is_a_transient_failure() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n{\"value\": [",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let source = http_source(addr, "s3cret-key", Duration::from_secs(5));
        let err = fetch_all(&source, 2).await.unwrap_err();
        assert!(
            matches!(err.error, FetchError::Connection { .. }),
            "unexpected error: {:?}",
            err.error
        );
        assert!(err.error.is_retryable());
        let pipeline: PipelineError = err.into();
        assert!(matches!(pipeline, PipelineError::TransientNetworkFailure { .. }));
        assert!(pipeline.is_retryable());
    }

    #[tokio::test]
    async fn unbuildable_request_is_not_retried() {
        let source = HttpPageSource::new(
            "not a url",
            Credentials::new("enumerator-bot", "s3cret-key"),
            PaginationStyle::OData,
            HttpClientConfig::default(),
        )
        .unwrap();
        let err = fetch_all(&source, 2).await.unwrap_err();
        assert!(matches!(err.error, FetchError::Request(_)));
        assert!(!err.error.is_retryable());
        let pipeline: PipelineError = err.into();
        assert!(matches!(pipeline, PipelineError::InvalidRequest { .. }));
        assert!(!pipeline.is_retryable());
    }
}
