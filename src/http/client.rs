//! HTTP client with retry and rate limiting
//!
//! Provides the session-scoped client a harvest run talks through:
//! - Minimum spacing between requests
//! - Shared retry budget with a fixed backoff schedule
//! - Status classification (terminal vs. retryable)
//! - Charset-aware body decoding, bounded chunked reads, line streaming
//! - Optional one-shot challenge bypass on 503 responses

use super::challenge::{is_challenge, ChallengeBypass, ChallengeSolver};
use super::rate_limit::RateLimiter;
use super::retry::{RetryBudget, RetryPolicy};
use crate::config::HarvestConfig;
use crate::decode::{
    charset_from_content_type, decode_text, encoding_for_label, limit_depth, parse_xml,
    replace_invalid, XML_DEPTH_LIMIT,
};
use crate::error::{Error, Result};
use crate::types::{Method, ResponseFormat};
use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Certificate, Client, RequestBuilder, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT_USER_AGENT: &str = concat!("opendata-harvester/", env!("CARGO_PKG_VERSION"));

/// Configuration for a single request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestConfig {
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Request body (JSON)
    pub body: Option<Value>,
}

impl RequestConfig {
    /// Create a new request config
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query parameter
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set JSON body
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A fully described request: where, how, and how to read the answer
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub config: RequestConfig,
    /// Body format of the expected response
    pub format: ResponseFormat,
    /// Read the body chunk by chunk and abort past the size ceiling
    pub chunked: bool,
}

impl HttpRequest {
    /// A GET request expecting JSON
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            config: RequestConfig::default(),
            format: ResponseFormat::Json,
            chunked: false,
        }
    }

    /// A POST request with a JSON body, expecting JSON
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            config: RequestConfig::default().json(body),
            ..Self::get(url)
        }
    }

    /// Add a query parameter
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.query.insert(key.into(), value.into());
        self
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(key.into(), value.into());
        self
    }

    /// Replace the request config
    #[must_use]
    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the expected response format
    #[must_use]
    pub fn format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    /// Read the body in bounded chunks
    #[must_use]
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    fn operation(&self) -> &'static str {
        match (self.method, self.format, self.chunked) {
            (Method::GET, ResponseFormat::Json, false) => "get_json",
            (Method::GET, ResponseFormat::Json, true) => "get_json_chunked",
            (Method::GET, ResponseFormat::Xml, false) => "get_xml",
            (Method::GET, ResponseFormat::Xml, true) => "get_xml_chunked",
            (Method::POST, ResponseFormat::Json, _) => "post_json",
            (Method::POST, ResponseFormat::Xml, _) => "post_xml",
        }
    }
}

/// A response read in full
#[derive(Debug)]
struct RawResponse {
    status: u16,
    headers: HeaderMap,
    body: String,
}

/// Session-scoped HTTP client with retry and rate limiting
///
/// One instance belongs to exactly one harvest run; dropping it releases
/// the connection pool and the cookie store.
pub struct HttpClient {
    client: Client,
    jar: Arc<Jar>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    user_agent: Mutex<Option<String>>,
    encoding: Option<&'static Encoding>,
    invalid_xml: Option<Regex>,
    max_size: usize,
    timeout: Duration,
    bypass: Option<ChallengeBypass>,
}

impl HttpClient {
    /// Open a session for one run
    ///
    /// `solver` is only used when the config enables the challenge bypass.
    pub fn connect(
        config: &HarvestConfig,
        solver: Option<Arc<dyn ChallengeSolver>>,
    ) -> Result<Self> {
        let jar = Arc::new(Jar::default());

        let mut headers = HeaderMap::new();
        for (name, value) in &config.additional_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(header_name, header_value);
        }

        let mut builder = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .default_headers(headers)
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(config.timeouts.total)
            .connect_timeout(config.timeouts.connect)
            .read_timeout(config.timeouts.read);

        if let Some(path) = &config.certfile {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        let encoding = match &config.encoding {
            Some(label) => Some(
                encoding_for_label(label)
                    .ok_or_else(|| Error::config(format!("unknown encoding '{label}'")))?,
            ),
            None => None,
        };

        let invalid_xml = config
            .invalid_xml_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::config(format!("invalid_xml_regex: {e}")))?;

        let bypass = if config.challenge_bypass {
            solver.map(ChallengeBypass::new)
        } else {
            None
        };

        Ok(Self {
            client: builder.build()?,
            jar,
            limiter: RateLimiter::new(config.download_delay),
            retry: RetryPolicy::new(config.retry_delays.clone()),
            user_agent: Mutex::new(config.user_agent.clone()),
            encoding,
            invalid_xml,
            max_size: config.max_size,
            timeout: config.timeouts.total,
            bypass,
        })
    }

    /// Retry policy of this session
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// A full retry budget for this session's policy
    pub fn budget(&self) -> RetryBudget {
        self.retry.budget()
    }

    /// Size ceiling for chunked reads, in bytes
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// User agent override currently in effect
    pub fn user_agent(&self) -> Option<String> {
        self.user_agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_user_agent(&self, agent: String) {
        *self
            .user_agent
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(agent);
    }

    // ========================================================================
    // Text requests
    // ========================================================================

    /// Send a request and return the body text, retrying transient failures
    pub async fn fetch_text(&self, request: &HttpRequest, budget: &mut RetryBudget) -> Result<String> {
        let operation = match request.method {
            Method::GET if request.chunked => "get_chunked",
            Method::GET => "get",
            Method::POST => "post",
        };
        self.retry
            .run(budget, operation, &request.url, Error::is_transient, || {
                self.attempt(request)
            })
            .await
    }

    /// GET and return the body text
    pub async fn get_text(
        &self,
        url: &str,
        config: &RequestConfig,
        budget: &mut RetryBudget,
    ) -> Result<String> {
        let request = HttpRequest::get(url).with_config(config.clone());
        self.fetch_text(&request, budget).await
    }

    /// POST a JSON body and return the body text
    pub async fn post_text(
        &self,
        url: &str,
        body: Value,
        budget: &mut RetryBudget,
    ) -> Result<String> {
        self.fetch_text(&HttpRequest::post(url, body), budget).await
    }

    /// GET reading the body in chunks, failing once it exceeds the ceiling
    pub async fn get_chunked(
        &self,
        url: &str,
        config: &RequestConfig,
        budget: &mut RetryBudget,
    ) -> Result<String> {
        let request = HttpRequest::get(url).with_config(config.clone()).chunked();
        self.fetch_text(&request, budget).await
    }

    /// GET and stream the decoded body line by line
    ///
    /// Only the initial request is rate limited and nothing is retried:
    /// a stream consumed halfway cannot be replayed without duplicating
    /// what was already read.
    pub async fn get_lines(
        &self,
        url: &str,
        config: &RequestConfig,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let request = HttpRequest::get(url).with_config(config.clone());
        let response = {
            let _permit = self.limiter.acquire().await;
            debug!(url = %request.url, "Opening line stream");
            self.build(&request)?
                .send()
                .await
                .map_err(|e| self.transport_error(e))?
        };

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::status(status, body));
        }

        let encoding = self.response_encoding(response.headers());
        Ok(split_lines(response.bytes_stream(), encoding))
    }

    // ========================================================================
    // Parsed requests
    // ========================================================================

    /// Send a request and parse the body, retrying transient and parse failures
    pub async fn fetch(&self, request: &HttpRequest, budget: &mut RetryBudget) -> Result<Value> {
        self.retry
            .run(
                budget,
                request.operation(),
                &request.url,
                |e| e.is_transient() || e.is_parse(),
                || async move {
                    let text = self.attempt(request).await?;
                    self.parse_body(request.format, &text)
                },
            )
            .await
    }

    /// GET and parse a JSON body
    pub async fn get_json(
        &self,
        url: &str,
        config: &RequestConfig,
        budget: &mut RetryBudget,
    ) -> Result<Value> {
        let request = HttpRequest::get(url).with_config(config.clone());
        self.fetch(&request, budget).await
    }

    /// POST a JSON body and parse the JSON answer
    pub async fn post_json(&self, url: &str, body: Value, budget: &mut RetryBudget) -> Result<Value> {
        self.fetch(&HttpRequest::post(url, body), budget).await
    }

    /// GET and parse an XML body into a depth-limited tree
    pub async fn get_xml(
        &self,
        url: &str,
        config: &RequestConfig,
        budget: &mut RetryBudget,
    ) -> Result<Value> {
        let request = HttpRequest::get(url)
            .with_config(config.clone())
            .format(ResponseFormat::Xml);
        self.fetch(&request, budget).await
    }

    /// Parse a body according to its format
    pub fn parse_body(&self, format: ResponseFormat, text: &str) -> Result<Value> {
        match format {
            ResponseFormat::Json => Ok(serde_json::from_str(text)?),
            ResponseFormat::Xml => {
                let mut value = match &self.invalid_xml {
                    Some(pattern) => parse_xml(&replace_invalid(text, pattern))?,
                    None => parse_xml(text)?,
                };
                limit_depth(&mut value, XML_DEPTH_LIMIT);
                Ok(value)
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// One attempt: send, bypass a challenge if needed, classify the status
    async fn attempt(&self, request: &HttpRequest) -> Result<String> {
        let response = self.send_once(request).await?;
        if response.status == 200 {
            return Ok(response.body);
        }

        if let Some(bypass) = &self.bypass {
            if is_challenge(response.status, &response.headers, &response.body) {
                let url = Url::parse(&request.url)?;
                let current = self.user_agent();
                if let Some(agent) = bypass.bypass(&url, current.as_deref(), &self.jar).await {
                    self.set_user_agent(agent);
                    let replay = self.send_once(request).await?;
                    if replay.status == 200 {
                        return Ok(replay.body);
                    }
                    return Err(Error::status(replay.status, replay.body));
                }
            }
        }

        Err(Error::status(response.status, response.body))
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<RawResponse> {
        let _permit = self.limiter.acquire().await;
        debug!(method = ?request.method, url = %request.url, "Sending request");

        let response = self
            .build(request)?
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let bytes = if request.chunked {
            self.read_bounded(response).await?
        } else {
            response.bytes().await.map_err(|e| self.transport_error(e))?
        };

        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let body = decode_text(&bytes, self.encoding, content_type);
        debug!(status, bytes = bytes.len(), "Received response");

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    async fn read_bounded(&self, response: Response) -> Result<Bytes> {
        let mut body = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| self.transport_error(e))?;
            buffer.extend_from_slice(&chunk);
            if buffer.len() > self.max_size {
                return Err(Error::too_much_data(format!(
                    "response body exceeds {} bytes",
                    self.max_size
                )));
            }
        }
        Ok(buffer.freeze())
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder> {
        let mut builder = self
            .client
            .request(reqwest::Method::from(request.method), &request.url);

        if let Some(agent) = self.user_agent() {
            builder = builder.header(USER_AGENT, agent);
        }
        for (key, value) in &request.config.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.config.query.is_empty() {
            builder = builder.query(&request.config.query);
        }
        if let Some(body) = &request.config.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            Error::Http(err)
        }
    }

    fn response_encoding(&self, headers: &HeaderMap) -> &'static Encoding {
        self.encoding
            .or_else(|| {
                headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(charset_from_content_type)
                    .and_then(encoding_for_label)
            })
            .unwrap_or(UTF_8)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .field("max_size", &self.max_size)
            .field("bypass", &self.bypass)
            .finish_non_exhaustive()
    }
}

/// Split a byte stream into decoded lines, terminators removed
fn split_lines<S>(body: S, encoding: &'static Encoding) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let decode = move |line: &[u8]| {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        encoding.decode_without_bom_handling(line).0.into_owned()
    };

    stream::unfold(
        (body.boxed(), BytesMut::new(), false),
        move |(mut body, mut buffer, mut done)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line = buffer.split_to(pos + 1);
                    return Some((Ok(decode(&line[..])), (body, buffer, done)));
                }
                if done {
                    if buffer.is_empty() {
                        return None;
                    }
                    let line = buffer.split();
                    return Some((Ok(decode(&line[..])), (body, buffer, done)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        buffer.clear();
                        return Some((Err(Error::Http(e)), (body, buffer, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
    .boxed()
}
