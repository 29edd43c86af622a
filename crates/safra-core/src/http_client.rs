//! HTTP transport shim.
//!
//! [`HttpSource`] turns any [`HttpClient`] into a [`SourceFetch`] by
//! expanding a URL template and classifying the response: 2xx bodies become
//! payloads, recognised blocking pages become [`FetchError::HardBlock`], and
//! transient statuses become retryable network errors so one retry executor
//! handles both transport and status failures.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::TimeoutSettings;
use crate::context::ExecutionContext;
use crate::data_source::{FetchFuture, FetchOutput, FetchRequest, SourceFetch};
use crate::error::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Overrides the client-wide timeout when set.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport failure before any status line was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Transport(String),
}

impl From<HttpError> for FetchError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::Timeout { after } => Self::Timeout { after },
            other => Self::network(other.to_string()),
        }
    }
}

pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

pub trait HttpClient: Send + Sync {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a>;
}

/// reqwest-backed client.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
    default_timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::from_timeouts(&TimeoutSettings::default())
    }

    /// Connect and pool timeouts map directly; read and write share the
    /// per-request deadline.
    pub fn from_timeouts(timeouts: &TimeoutSettings) -> Self {
        let default_timeout = timeouts.read() + timeouts.write();
        let client = reqwest::Client::builder()
            .user_agent(concat!("safra/", env!("CARGO_PKG_VERSION")))
            .cookie_store(true)
            .connect_timeout(timeouts.connect())
            .pool_idle_timeout(timeouts.pool())
            .timeout(default_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client: Arc::new(client),
            default_timeout,
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
            default_timeout: TimeoutSettings::default().read(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        Box::pin(async move {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            let timeout = request.timeout.unwrap_or(self.default_timeout);
            builder = builder.timeout(timeout);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await.map_err(|error| {
                if error.is_timeout() {
                    HttpError::Timeout { after: timeout }
                } else if error.is_connect() {
                    HttpError::Connect(error.to_string())
                } else {
                    HttpError::Transport(error.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_owned(), value.to_owned()))
                })
                .collect();
            let body = response.bytes().await.map_err(|error| {
                if error.is_timeout() {
                    HttpError::Timeout { after: timeout }
                } else {
                    HttpError::Transport(format!("failed to read response body: {error}"))
                }
            })?;

            Ok(HttpResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        })
    }
}

/// Replays queued responses and records every request. For tests and dry runs.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Result<HttpResponse, HttpError>>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<HttpResponse, HttpError>) {
        self.responses
            .lock()
            .expect("scripted responses should not be poisoned")
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .expect("scripted requests should not be poisoned")
            .clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        self.requests
            .lock()
            .expect("scripted requests should not be poisoned")
            .push(request);
        let next = self
            .responses
            .lock()
            .expect("scripted responses should not be poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(HttpError::Transport(String::from("no scripted response left"))));
        Box::pin(async move { next })
    }
}

/// Recognises anti-bot interstitials served in place of real content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardBlockDetector {
    pub statuses: Vec<u16>,
    /// Lowercase substrings matched against the body and header names.
    pub markers: Vec<String>,
    pub provider: String,
}

impl Default for HardBlockDetector {
    fn default() -> Self {
        Self {
            statuses: vec![403, 429, 503],
            markers: ["cloudflare", "cf-chl", "just a moment", "attention required", "cf-ray"]
                .into_iter()
                .map(String::from)
                .collect(),
            provider: String::from("cloudflare"),
        }
    }
}

impl HardBlockDetector {
    /// Status and marker must both match.
    pub fn is_blocked(&self, response: &HttpResponse) -> bool {
        if !self.statuses.contains(&response.status) {
            return false;
        }
        let body = response.text().to_ascii_lowercase();
        self.markers.iter().any(|marker| {
            body.contains(marker.as_str()) || response.headers.contains_key(marker.as_str())
        })
    }
}

/// Map a response to a payload or a classified failure.
pub fn classify_response(
    response: HttpResponse,
    detector: &HardBlockDetector,
) -> Result<Vec<u8>, FetchError> {
    if response.is_success() {
        return Ok(response.body);
    }
    if detector.is_blocked(&response) {
        return Err(FetchError::hard_block(response.status, detector.provider.clone()));
    }

    let snippet: String = response.text().chars().take(200).collect();
    Err(FetchError::status(response.status, snippet))
}

/// [`SourceFetch`] over a URL template.
///
/// `{key}` in the template is replaced by the url-encoded request key and the
/// request parameters are appended as a query string.
pub struct HttpSource {
    client: Arc<dyn HttpClient>,
    url_template: String,
    headers: BTreeMap<String, String>,
    detector: HardBlockDetector,
}

impl HttpSource {
    pub fn new(client: Arc<dyn HttpClient>, url_template: impl Into<String>) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            headers: BTreeMap::new(),
            detector: HardBlockDetector::default(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_detector(mut self, detector: HardBlockDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn url_for(&self, request: &FetchRequest) -> String {
        let mut url = self
            .url_template
            .replace("{key}", &urlencoding::encode(&request.key));
        if !request.params.is_empty() {
            let query = request
                .params
                .iter()
                .map(|(name, value)| {
                    format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }
}

impl SourceFetch for HttpSource {
    fn fetch<'a>(&'a self, request: &'a FetchRequest, ctx: &'a ExecutionContext) -> FetchFuture<'a> {
        Box::pin(async move {
            let url = self.url_for(request);
            let mut http_request = HttpRequest::get(url.clone()).with_header("x-request-id", ctx.request_id());
            for (name, value) in &self.headers {
                http_request = http_request.with_header(name.clone(), value.clone());
            }

            let response = self.client.execute(http_request).await?;
            let status = response.status;
            let payload = classify_response(response, &self.detector)?;
            Ok(FetchOutput::new(payload).with_metadata(serde_json::json!({
                "url": url,
                "status": status,
            })))
        })
    }
}
