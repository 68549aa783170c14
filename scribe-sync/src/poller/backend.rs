//! Job submission and status endpoints

use async_trait::async_trait;
use reqwest::Method;
use scribe_common::model::{JobStatusResponse, JobTicket, SessionId};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::transport::{CallOptions, RequestBody, Transport, TransportError};

/// A job to submit
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Submission path (`POST`)
    pub path: String,
    pub body: Option<Value>,
}

impl JobRequest {
    pub fn new(path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            path: path.into(),
            body,
        }
    }

    /// Generate (or regenerate) the summary of a session
    pub fn summarize(session_id: SessionId) -> Self {
        Self::new(
            "/jobs",
            Some(json!({ "kind": "summarize", "session_id": session_id })),
        )
    }

    /// Re-run transcription and summary for a session
    pub fn reprocess(session_id: SessionId) -> Self {
        Self::new(format!("/sessions/{}/reprocess", session_id), None)
    }
}

/// Backend side of the task poller
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Submit a job, returning where to poll it
    async fn submit(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobTicket, TransportError>;

    /// Query the job status once
    async fn status(
        &self,
        poll_url: &str,
        cancel: &CancellationToken,
    ) -> Result<JobStatusResponse, TransportError>;

    /// Whether the credential is already known to be expired
    fn session_expired(&self) -> bool {
        false
    }
}

/// `JobBackend` over the HTTP transport
#[derive(Clone)]
pub struct HttpJobBackend {
    transport: Transport,
}

impl HttpJobBackend {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    async fn submit(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<JobTicket, TransportError> {
        let body = request.body.clone().map(RequestBody::Json);
        self.transport
            .call(
                Method::POST,
                &request.path,
                body,
                CallOptions::default().with_cancel(cancel),
            )
            .await?
            .json()
    }

    async fn status(
        &self,
        poll_url: &str,
        cancel: &CancellationToken,
    ) -> Result<JobStatusResponse, TransportError> {
        self.transport
            .get_json(poll_url, CallOptions::default().with_cancel(cancel))
            .await
    }

    fn session_expired(&self) -> bool {
        self.transport.tokens().is_session_expired()
    }
}
