//! Test Helper Utilities
//!
//! Scripted fakes for the backend seams (job backend, change feed, session
//! source), fixtures, and an ephemeral-port HTTP server.

#![allow(dead_code)]

pub mod log_capture;

pub use log_capture::LogCapture;

use async_trait::async_trait;
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use scribe_common::config::TomlConfig;
use scribe_common::events::ClientEvent;
use scribe_common::model::{
    Artifact, ChangeEvent, ChangeOperation, ChannelState, JobStatusResponse, JobTicket,
    RecordOrigin, Session, SessionId, SessionStatus,
};
use scribe_sync::channels::{ChangeFeed, ChannelError, FeedMessage, SubscriptionRequest};
use scribe_sync::poller::{JobBackend, JobRequest};
use scribe_sync::reconciler::SessionSource;
use scribe_sync::transport::TransportError;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Job backend
// ---------------------------------------------------------------------------

/// Job backend answering polls from a script
///
/// Once the script runs out, every poll gets `fallback` (if set).
pub struct ScriptedJobBackend {
    job_id: String,
    script: Mutex<VecDeque<Result<JobStatusResponse, TransportError>>>,
    fallback: Mutex<Option<Result<JobStatusResponse, TransportError>>>,
    submitted: Mutex<Vec<JobRequest>>,
    polls: AtomicUsize,
    expired: AtomicBool,
}

pub fn status(status: &str) -> JobStatusResponse {
    JobStatusResponse {
        status: status.to_string(),
        progress: None,
        result: None,
        error: None,
    }
}

pub fn success(result: Value) -> JobStatusResponse {
    JobStatusResponse {
        result: Some(result),
        ..status("SUCCESS")
    }
}

pub fn unauthorized() -> TransportError {
    TransportError::HttpStatus {
        code: 401,
        body: "jwt expired".to_string(),
    }
}

impl ScriptedJobBackend {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            expired: AtomicBool::new(false),
        }
    }

    pub fn then(self, response: JobStatusResponse) -> Self {
        self.script.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn then_error(self, error: TransportError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn forever(self, response: Result<JobStatusResponse, TransportError>) -> Self {
        *self.fallback.lock().unwrap() = Some(response);
        self
    }

    pub fn expire_session(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<JobRequest> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobBackend for ScriptedJobBackend {
    async fn submit(
        &self,
        request: &JobRequest,
        _cancel: &CancellationToken,
    ) -> Result<JobTicket, TransportError> {
        self.submitted.lock().unwrap().push(request.clone());
        Ok(JobTicket {
            job_id: self.job_id.clone(),
            poll_url: format!("/jobs/{}", self.job_id),
        })
    }

    async fn status(
        &self,
        _poll_url: &str,
        cancel: &CancellationToken,
    ) -> Result<JobStatusResponse, TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
    }

    fn session_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// In-memory change feed; tests push states and events by channel name
pub struct MemoryChangeFeed {
    senders: Mutex<HashMap<String, mpsc::Sender<FeedMessage>>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    auto_ack: bool,
    fail_unsubscribe: AtomicBool,
}

impl MemoryChangeFeed {
    /// Acknowledges every subscription immediately
    pub fn new() -> Self {
        Self::build(true)
    }

    /// Never acknowledges; handshakes time out
    pub fn silent() -> Self {
        Self::build(false)
    }

    fn build(auto_ack: bool) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
            auto_ack,
            fail_unsubscribe: AtomicBool::new(false),
        }
    }

    pub fn fail_unsubscribe(&self) {
        self.fail_unsubscribe.store(true, Ordering::SeqCst);
    }

    fn sender(&self, name: &str) -> mpsc::Sender<FeedMessage> {
        self.senders
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("channel {} not subscribed", name))
    }

    pub async fn emit(&self, name: &str, event: ChangeEvent) {
        let _ = self.sender(name).send(FeedMessage::Event(event)).await;
    }

    pub async fn set_state(&self, name: &str, state: ChannelState) {
        let _ = self.sender(name).send(FeedMessage::State(state)).await;
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.senders.lock().unwrap().contains_key(name)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<mpsc::Receiver<FeedMessage>, ChannelError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        if self.auto_ack {
            let _ = tx.try_send(FeedMessage::State(ChannelState::Subscribed));
        }
        self.senders.lock().unwrap().insert(request.name.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), ChannelError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.senders.lock().unwrap().remove(name);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::Unsubscribe {
                name: name.to_string(),
                message: "backend unreachable".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session source
// ---------------------------------------------------------------------------

/// In-memory session endpoints
pub struct MemorySessionSource {
    rows: Mutex<Vec<Session>>,
    fetches: AtomicUsize,
    fetch_delay: Mutex<Duration>,
    /// Rows are read when the fetch starts rather than when it returns
    read_at_start: AtomicBool,
    fail_next_fetch: AtomicBool,
    fail_writes: AtomicBool,
    updates: Mutex<Vec<(SessionId, Value)>>,
}

impl MemorySessionSource {
    pub fn new(rows: Vec<Session>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fetches: AtomicUsize::new(0),
            fetch_delay: Mutex::new(Duration::ZERO),
            read_at_start: AtomicBool::new(false),
            fail_next_fetch: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn set_rows(&self, rows: Vec<Session>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    /// Fetches return the rows as they were when the request started
    pub fn read_rows_at_start(&self) {
        self.read_at_start.store(true, Ordering::SeqCst);
    }

    pub fn remove_row(&self, id: SessionId) {
        self.rows.lock().unwrap().retain(|row| row.id != id);
    }

    pub fn fail_next_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(SessionId, Value)> {
        self.updates.lock().unwrap().clone()
    }

    fn write_error() -> TransportError {
        TransportError::HttpStatus {
            code: 500,
            body: "write rejected".to_string(),
        }
    }
}

#[async_trait]
impl SessionSource for MemorySessionSource {
    async fn fetch_sessions(&self, _owner_id: &str) -> Result<Vec<Session>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let early = self
            .read_at_start
            .load(Ordering::SeqCst)
            .then(|| self.rows.lock().unwrap().clone());
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(TransportError::HttpStatus {
                code: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(early.unwrap_or_else(|| self.rows.lock().unwrap().clone()))
    }

    async fn create_session(&self, session: &Session) -> Result<Session, TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::write_error());
        }
        let mut stored = session.clone();
        stored.origin = RecordOrigin::Authoritative;
        self.rows.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::write_error());
        }
        self.rows.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }

    async fn update_session(&self, id: SessionId, fields: Value) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::write_error());
        }
        self.updates.lock().unwrap().push((id, fields));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const OWNER: &str = "owner-1";

/// Authoritative session created `age_minutes` ago
pub fn session(status: SessionStatus, age_minutes: i64) -> Session {
    let mut session = Session::optimistic(OWNER, format!("Session {}", age_minutes));
    session.status = status;
    session.created_at = Utc::now() - ChronoDuration::minutes(age_minutes);
    session.origin = RecordOrigin::Authoritative;
    session
}

pub fn with_transcript(mut session: Session, content: &str) -> Session {
    session.artifacts.transcripts = vec![Artifact {
        id: format!("transcript-{}", content.len()),
        content: Some(content.to_string()),
        updated_at: None,
        fetched_at: Utc::now(),
    }];
    session
}

pub fn session_row(session: &Session) -> Value {
    json!({
        "id": session.id,
        "user_id": session.owner_id,
        "title": session.title,
        "status": session.status,
        "created_at": session.created_at,
        "transcripts": session.artifacts.transcripts,
    })
}

pub fn insert_event(session: &Session) -> ChangeEvent {
    ChangeEvent::new(
        ChangeOperation::Insert,
        "sessions",
        None,
        Some(session_row(session)),
    )
}

pub fn status_event(id: SessionId, status: SessionStatus) -> ChangeEvent {
    ChangeEvent::new(
        ChangeOperation::Update,
        "sessions",
        None,
        Some(json!({ "id": id, "status": status })),
    )
}

pub fn delete_event(id: SessionId) -> ChangeEvent {
    ChangeEvent::new(
        ChangeOperation::Delete,
        "sessions",
        Some(json!({ "id": id })),
        None,
    )
}

pub fn transcript_event(session_id: SessionId) -> ChangeEvent {
    ChangeEvent::new(
        ChangeOperation::Insert,
        "transcripts",
        None,
        Some(json!({ "id": Uuid::new_v4(), "session_id": session_id, "content": "hi" })),
    )
}

/// Config with short timings for tests
pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.poll.interval_ms = 20;
    config.poll.auth_retry_interval_ms = 10;
    config.reconcile.insert_refetch_delay_ms = 1000;
    config.reconcile.reprocess_timeout_ms = 4000;
    config.channels.handshake_timeout_ms = 500;
    config
}

/// Everything currently queued on an event receiver
pub fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `condition` every 10ms (virtual time under `start_paused`)
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Serve `router` on an ephemeral port; returns the base URL
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}
