//! HTTP transport
//!
//! Minimal calling convention shared by every backend call: bearer token
//! injection, a hard per-call timeout, caller-driven cancellation and
//! conversion of non-2xx responses into [`TransportError::HttpStatus`].
//!
//! No retries here; the task poller owns its retry policy.

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// User-Agent header sent with every request
const USER_AGENT: &str = concat!("scribe-sync/", env!("CARGO_PKG_VERSION"));

/// Transport errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Call exceeded its hard timeout
    #[error("{method} {url} timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        url: String,
        timeout_ms: u64,
    },

    /// Backend answered with a non-2xx status
    #[error("HTTP {code}: {body}")]
    HttpStatus { code: u16, body: String },

    /// Connection-level failure (DNS, refused, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Caller cancelled the call
    #[error("Request cancelled")]
    Cancelled,

    /// Response body did not decode into the expected type
    #[error("Decode error: {0}")]
    Decode(String),
}

impl TransportError {
    /// 401/403: the credential was rejected
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::HttpStatus { code: 401 | 403, .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::HttpStatus { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Credential accessor, polled synchronously on every call
pub trait TokenProvider: Send + Sync {
    /// Current bearer token, if signed in
    fn current_token(&self) -> Option<String>;

    /// Whether the auth layer already knows the session has expired
    fn is_session_expired(&self) -> bool {
        false
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_token(&self) -> Option<String> {
        self()
    }
}

/// Fixed token (CLI usage, tests)
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn current_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Request body variants
///
/// JSON is serialized with an `application/json` content type. Multipart
/// and raw bytes are passed through as-is; raw bytes only get a content type
/// when the caller supplies one.
pub enum RequestBody {
    Json(serde_json::Value),
    Multipart(reqwest::multipart::Form),
    Bytes {
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the transport default timeout
    pub timeout: Option<Duration>,
    /// Do not attach the bearer token (trusted same-process hops)
    pub skip_auth: bool,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn with_cancel(mut self, cancel: &CancellationToken) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }
}

/// Successful (2xx) response with its body fully read
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    body: Vec<u8>,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }
}

/// Backend HTTP client
#[derive(Clone)]
pub struct Transport {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    default_timeout: Duration,
}

impl Transport {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        default_timeout: Duration,
    ) -> Result<Self, TransportError> {
        // Timeouts are applied per call; long-lived event streams must not be cut
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            default_timeout,
        })
    }

    pub fn tokens(&self) -> &Arc<dyn TokenProvider> {
        &self.tokens
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URLs (poll URLs handed out by the backend) are used verbatim
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, url: &str, skip_auth: bool) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        if skip_auth {
            return builder;
        }
        match self.tokens.current_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Perform one call
    ///
    /// # Errors
    /// - `Timeout` when the call (including reading the body) exceeds the timeout
    /// - `Cancelled` when `options.cancel` fires first
    /// - `HttpStatus` for any non-2xx status, carrying the body text
    /// - `Network` for connection failures
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        options: CallOptions,
    ) -> Result<Response, TransportError> {
        let url = self.url(path);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let cancel = options.cancel.unwrap_or_default();

        let mut request = self.request(method.clone(), &url, options.skip_auth);
        request = match body {
            Some(RequestBody::Json(value)) => request.json(&value),
            Some(RequestBody::Multipart(form)) => request.multipart(form),
            Some(RequestBody::Bytes { content_type, data }) => {
                let request = request.body(data);
                match content_type {
                    Some(content_type) => request.header(CONTENT_TYPE, content_type),
                    None => request,
                }
            }
            None => request,
        };

        debug!(method = %method, url = %url, timeout_ms = timeout.as_millis() as u64, "HTTP call");

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body.to_vec()))
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            outcome = tokio::time::timeout(timeout, exchange) => outcome,
        };

        let timed_out = || TransportError::Timeout {
            method: method.to_string(),
            url: url.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let (status, body) = match outcome {
            Err(_) => return Err(timed_out()),
            Ok(Err(e)) if e.is_timeout() => return Err(timed_out()),
            Ok(Err(e)) => return Err(TransportError::Network(e.to_string())),
            Ok(Ok(exchanged)) => exchanged,
        };

        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(Response {
            status: status.as_u16(),
            body,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<T, TransportError> {
        self.call(Method::GET, path, None, options).await?.json()
    }

    pub async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
        options: CallOptions,
    ) -> Result<T, TransportError> {
        let value =
            serde_json::to_value(body).map_err(|e| TransportError::Decode(e.to_string()))?;
        self.call(method, path, Some(RequestBody::Json(value)), options)
            .await?
            .json()
    }

    /// Open a long-lived `text/event-stream` response
    ///
    /// Only the handshake (status line) is bounded by `options.timeout`; the
    /// returned response streams until the server or caller ends it.
    pub async fn open_event_stream(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(path);
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let cancel = options.cancel.unwrap_or_default();
        let request = self
            .request(Method::GET, &url, options.skip_auth)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            outcome = tokio::time::timeout(timeout, request.send()) => outcome,
        };

        let response = match outcome {
            Err(_) => {
                return Err(TransportError::Timeout {
                    method: "GET".to_string(),
                    url,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => return Err(TransportError::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
