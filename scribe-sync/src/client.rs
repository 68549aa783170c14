//! Per-owner sync facade
//!
//! Wires the transport, task poller, channel manager and session reconciler
//! for one signed-in owner. Everything the client spawns hangs off one
//! cancellation token, so `shutdown` stops pollers, channel pumps and the
//! reconciler together.

use scribe_common::config::TomlConfig;
use scribe_common::events::{ClientEvent, EventBus};
use scribe_common::model::{ArtifactKind, Session, SessionId, SessionPatch, SESSIONS_TABLE};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channels::{
    Channel, ChannelFilter, ChannelHealth, ChannelManager, ChangeFeed, EventHandler,
    SseChangeFeed, SubscriptionRequest,
};
use crate::error::{ClientError, ClientResult};
use crate::poller::{HttpJobBackend, JobBackend, JobRequest, PollPolicy, TaskPoller};
use crate::reconciler::{HttpSessionSource, SessionReconciler, SessionSnapshot, SessionSource};
use crate::transport::{TokenProvider, Transport};

/// Event bus capacity for client notifications
const EVENT_CAPACITY: usize = 256;

const ARTIFACT_KINDS: [ArtifactKind; 3] = [
    ArtifactKind::Audio,
    ArtifactKind::Transcript,
    ArtifactKind::Summary,
];

/// Backend seams of a client, swappable for tests
pub struct SyncParts {
    pub jobs: Arc<dyn JobBackend>,
    pub feed: Arc<dyn ChangeFeed>,
    pub source: Arc<dyn SessionSource>,
    pub events: EventBus,
    pub config: TomlConfig,
}

impl SyncParts {
    /// HTTP-backed parts for `config`
    pub fn http(config: TomlConfig, tokens: Arc<dyn TokenProvider>) -> ClientResult<Self> {
        config.validate()?;
        let transport = Transport::new(
            config.api_base_url.clone(),
            tokens,
            config.request_timeout(),
        )?;
        let handshake_timeout = Duration::from_millis(config.channels.handshake_timeout_ms);

        Ok(Self {
            jobs: Arc::new(HttpJobBackend::new(transport.clone())),
            feed: Arc::new(SseChangeFeed::new(transport.clone(), handshake_timeout)),
            source: Arc::new(HttpSessionSource::new(transport)),
            events: EventBus::new(EVENT_CAPACITY),
            config,
        })
    }
}

pub struct SyncClient {
    owner_id: String,
    poller: TaskPoller,
    channels: ChannelManager,
    reconciler: SessionReconciler,
    source: Arc<dyn SessionSource>,
    events: EventBus,
    cancel: CancellationToken,
}

impl SyncClient {
    pub fn new(
        config: TomlConfig,
        owner_id: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> ClientResult<Self> {
        let parts = SyncParts::http(config, tokens)?;
        Ok(Self::with_parts(owner_id, parts))
    }

    /// Build from explicit parts; must be called inside a tokio runtime
    pub fn with_parts(owner_id: impl Into<String>, parts: SyncParts) -> Self {
        let owner_id = owner_id.into();
        let cancel = CancellationToken::new();
        let SyncParts {
            jobs,
            feed,
            source,
            events,
            config,
        } = parts;

        let poller = TaskPoller::new(jobs, PollPolicy::from(&config.poll), events.clone());
        let channels = ChannelManager::new(feed, &config.channels, events.clone());
        let reconciler = SessionReconciler::spawn(
            owner_id.clone(),
            source.clone(),
            &config.reconcile,
            events.clone(),
            &cancel,
        );

        Self {
            owner_id,
            poller,
            channels,
            reconciler,
            source,
            events,
            cancel,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Initial load, then push subscriptions
    ///
    /// Opens the owner's session channel (waiting for its handshake) and the
    /// artifact channels scoped to the loaded sessions. A background task
    /// keeps the artifact channels' session sets current.
    pub async fn start(&self) -> ClientResult<()> {
        info!(owner = %self.owner_id, "Starting sync client");
        self.reconciler.load().await?;

        let sessions = self.channels.create_channel(
            SubscriptionRequest::new(
                format!("{}:{}", SESSIONS_TABLE, self.owner_id),
                self.owner_id.clone(),
                SESSIONS_TABLE,
            ),
            ChannelFilter::All,
            self.reconciler.event_handler(),
        );
        sessions.ready().await?;

        let ids = self.reconciler.snapshot().ids();
        ensure_artifact_channels(
            &self.channels,
            &self.owner_id,
            &ids,
            &self.reconciler.event_handler(),
        )
        .await;
        self.spawn_channel_watcher();

        info!(owner = %self.owner_id, sessions = ids.len(), "Sync client started");
        Ok(())
    }

    fn spawn_channel_watcher(&self) {
        let mut snapshots = self.reconciler.subscribe();
        let channels = self.channels.clone();
        let handler = self.reconciler.event_handler();
        let owner_id = self.owner_id.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let ids = snapshots.borrow_and_update().ids();
                ensure_artifact_channels(&channels, &owner_id, &ids, &handler).await;
            }
            debug!(owner = %owner_id, "Channel watcher stopped");
        });
    }

    fn require(&self, id: SessionId) -> ClientResult<()> {
        match self.reconciler.snapshot().get(id) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(id)),
        }
    }

    /// Optimistically create a session, then persist it
    ///
    /// The record is visible immediately; a rejected write removes it again.
    pub async fn create_session(&self, title: impl Into<String>) -> ClientResult<Session> {
        let session = Session::optimistic(self.owner_id.clone(), title);
        let id = session.id;
        self.reconciler.create_local(session.clone());

        match self.source.create_session(&session).await {
            Ok(stored) => {
                self.reconciler.confirm_create(stored.clone());
                Ok(stored)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Create failed");
                self.reconciler.create_failed(id);
                Err(e.into())
            }
        }
    }

    /// Optimistically delete a session; restored if the backend refuses
    pub async fn delete_session(&self, id: SessionId) -> ClientResult<()> {
        self.require(id)?;
        self.reconciler.delete_local(id);

        match self.source.delete_session(id).await {
            Ok(()) => {
                self.reconciler.delete_acked(id);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Delete failed, restoring");
                self.reconciler.delete_failed(id);
                Err(e.into())
            }
        }
    }

    pub async fn select_template(
        &self,
        id: SessionId,
        template_id: Option<String>,
    ) -> ClientResult<()> {
        self.require(id)?;
        self.reconciler.select_template(id, template_id.clone());
        self.source
            .update_session(id, json!({ "template_id": template_id }))
            .await?;
        Ok(())
    }

    /// Submit a summary job and poll it to completion
    pub async fn request_summary(&self, id: SessionId) -> ClientResult<Value> {
        self.require(id)?;
        let cancel = self.cancel.child_token();
        let result = self.poller.run(&JobRequest::summarize(id), &cancel).await?;
        self.apply_job_result(id, &result);
        Ok(result)
    }

    /// Re-run the pipeline for a session
    ///
    /// Returns once the backend job finished; completion of the re-processed
    /// content is reported separately through `ReprocessingFinished` or
    /// `ReprocessingTimedOut` events.
    pub async fn reprocess_session(&self, id: SessionId) -> ClientResult<()> {
        self.require(id)?;
        self.reconciler.begin_reprocess(id);

        let cancel = self.cancel.child_token();
        match self.poller.run(&JobRequest::reprocess(id), &cancel).await {
            Ok(result) => {
                self.apply_job_result(id, &result);
                Ok(())
            }
            Err(e) => {
                self.reconciler.end_reprocess(id);
                Err(e.into())
            }
        }
    }

    /// Fold session fields a job returned, then re-fetch for the rest
    fn apply_job_result(&self, id: SessionId, result: &Value) {
        if let Ok(mut patch) = SessionPatch::from_row(result) {
            if !patch.is_empty() {
                patch.id = Some(id);
                self.reconciler.apply_patch(patch);
            }
        }
        self.reconciler.refresh();
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        self.reconciler.fetch(false).await?;
        Ok(())
    }

    /// Consumer visibility; becoming active triggers a corrective fetch
    /// for events dropped while hidden
    pub fn set_active(&self, active: bool) {
        let was_active = self.channels.set_active(active);
        if active && !was_active {
            debug!(owner = %self.owner_id, "Became active, refreshing");
            self.reconciler.refresh();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.reconciler.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.reconciler.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn channel_health(&self) -> ChannelHealth {
        self.channels.health()
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn reconciler(&self) -> &SessionReconciler {
        &self.reconciler
    }

    /// Stop pollers, tear down channels, stop the reconciler
    pub async fn shutdown(&self) {
        info!(owner = %self.owner_id, "Shutting down sync client");
        self.cancel.cancel();
        self.channels.cleanup_all().await;
        self.reconciler.shutdown();
    }
}

async fn ensure_artifact_channels(
    channels: &ChannelManager,
    owner_id: &str,
    ids: &HashSet<SessionId>,
    handler: &EventHandler,
) -> Vec<Channel> {
    let mut ensured = Vec::with_capacity(ARTIFACT_KINDS.len());
    for kind in ARTIFACT_KINDS {
        let request = SubscriptionRequest::new(
            format!("{}:{}", kind.table(), owner_id),
            owner_id,
            kind.table(),
        );
        ensured.push(
            channels
                .ensure_session_channel(request, ids, handler.clone())
                .await,
        );
    }
    ensured
}
