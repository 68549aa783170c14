//! Session reconciler
//!
//! Merges three unordered inputs into one canonical session collection:
//! push change events, bulk fetches, and local optimistic writes. All inputs
//! are commands on a single mailbox drained by one task, so merges never race
//! and apply in arrival order. Consumers read the collection through a
//! `watch` channel of [`SessionSnapshot`]s.
//!
//! Merge rules live in [`store`]; this module owns scheduling: the
//! fetch-in-flight guard, the coalesced deferred re-fetch after inserts, and
//! re-processing deadlines.

mod reprocess;
mod source;
mod store;

pub use reprocess::{ReprocessProgress, ReprocessTracker};
pub use source::{decode_rows, HttpSessionSource, SessionSource};
pub use store::{FetchMerge, MergeOutcome, SessionStore, Tombstone};

use chrono::Utc;
use scribe_common::config::ReconcileSettings;
use scribe_common::events::{ClientEvent, EventBus};
use scribe_common::model::{
    ChangeEvent, ChangeOperation, EntityKind, Session, SessionId, SessionPatch,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channels::EventHandler;
use crate::transport::TransportError;

/// Published view of the collection
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Newest first
    pub sessions: Arc<Vec<Session>>,
    /// A bulk fetch is in flight
    pub loading: bool,
    /// The initial full load has completed
    pub loaded: bool,
    /// Sessions with a re-processing request still pending
    pub reprocessing: Arc<HashSet<SessionId>>,
}

impl SessionSnapshot {
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> HashSet<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn is_reprocessing(&self, id: SessionId) -> bool {
        self.reprocessing.contains(&id)
    }
}

type FetchReply = oneshot::Sender<Result<(), TransportError>>;

enum Command {
    Push(ChangeEvent),
    Refresh {
        full: bool,
        reply: Option<FetchReply>,
    },
    FetchCompleted {
        full: bool,
        seq: u64,
        result: Result<Vec<Session>, TransportError>,
    },
    DeferredRefetchDue,
    CreateLocal(Session),
    ConfirmCreate(Session),
    CreateFailed(SessionId),
    DeleteLocal(SessionId),
    DeleteAcked(SessionId),
    DeleteFailed(SessionId),
    SelectTemplate {
        id: SessionId,
        template_id: Option<String>,
    },
    ApplyPatch(SessionPatch),
    BeginReprocess(SessionId),
    EndReprocess(SessionId),
    ReprocessDeadline {
        id: SessionId,
        generation: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the reconciler task
#[derive(Clone)]
pub struct SessionReconciler {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
}

impl SessionReconciler {
    /// Start the reconciler task for one owner
    ///
    /// The task stops when `cancel` fires or `shutdown` is called.
    pub fn spawn(
        owner_id: impl Into<String>,
        source: Arc<dyn SessionSource>,
        settings: &ReconcileSettings,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let cancel = cancel.child_token();

        let actor = Actor {
            owner_id: owner_id.into(),
            store: SessionStore::new(),
            reprocess: ReprocessTracker::new(Duration::from_millis(settings.reprocess_timeout_ms)),
            source,
            events,
            tx: tx.clone(),
            snapshot: snapshot_tx,
            fetch_in_flight: false,
            waiters: Vec::new(),
            follow_up: None,
            refetch_pending: false,
            refetch_delay: Duration::from_millis(settings.insert_refetch_delay_ms),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            tx,
            snapshot: snapshot_rx,
            cancel,
        }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            debug!("Reconciler stopped, command dropped");
        }
    }

    /// Feed one push event
    pub fn apply_event(&self, event: ChangeEvent) {
        self.send(Command::Push(event));
    }

    /// Channel handler forwarding events into this reconciler
    pub fn event_handler(&self) -> EventHandler {
        let tx = self.tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(Command::Push(event));
        })
    }

    /// Initial full load; resolves once the fetch that covers it completes
    pub async fn load(&self) -> Result<(), TransportError> {
        self.fetch(true).await
    }

    /// Id-keyed re-fetch; resolves once the fetch that covers it completes
    pub async fn fetch(&self, full: bool) -> Result<(), TransportError> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Refresh {
            full,
            reply: Some(reply),
        });
        done.await.unwrap_or(Err(TransportError::Cancelled))
    }

    /// Request a re-fetch without waiting for it
    pub fn refresh(&self) {
        self.send(Command::Refresh {
            full: false,
            reply: None,
        });
    }

    pub fn create_local(&self, session: Session) {
        self.send(Command::CreateLocal(session));
    }

    pub fn confirm_create(&self, session: Session) {
        self.send(Command::ConfirmCreate(session));
    }

    pub fn create_failed(&self, id: SessionId) {
        self.send(Command::CreateFailed(id));
    }

    pub fn delete_local(&self, id: SessionId) {
        self.send(Command::DeleteLocal(id));
    }

    pub fn delete_acked(&self, id: SessionId) {
        self.send(Command::DeleteAcked(id));
    }

    pub fn delete_failed(&self, id: SessionId) {
        self.send(Command::DeleteFailed(id));
    }

    pub fn select_template(&self, id: SessionId, template_id: Option<String>) {
        self.send(Command::SelectTemplate { id, template_id });
    }

    /// Merge a locally known partial row (job results)
    pub fn apply_patch(&self, patch: SessionPatch) {
        self.send(Command::ApplyPatch(patch));
    }

    pub fn begin_reprocess(&self, id: SessionId) {
        self.send(Command::BeginReprocess(id));
    }

    /// Drop a re-processing request (its job failed)
    pub fn end_reprocess(&self, id: SessionId) {
        self.send(Command::EndReprocess(id));
    }

    /// Wait until every command sent before this call has been applied
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Flush(tx));
        let _ = rx.await;
    }

    /// Flush, then wait for any fetch in flight to land
    pub async fn settle(&self) {
        self.flush().await;
        let mut rx = self.snapshot.clone();
        let _ = rx.wait_for(|s| !s.loading).await;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Actor {
    owner_id: String,
    store: SessionStore,
    reprocess: ReprocessTracker,
    source: Arc<dyn SessionSource>,
    events: EventBus,
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    fetch_in_flight: bool,
    /// Callers waiting on the fetch in flight
    waiters: Vec<FetchReply>,
    /// Fetch requested while one was in flight: (full, waiters)
    follow_up: Option<(bool, Vec<FetchReply>)>,
    refetch_pending: bool,
    refetch_delay: Duration,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!(owner = %self.owner_id, "Reconciler started");
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = rx.recv() => command,
            };
            match command {
                Some(command) => self.handle(command),
                None => break,
            }
        }
        debug!(owner = %self.owner_id, "Reconciler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Push(event) => self.apply_push(event),
            Command::Refresh { full, reply } => self.start_fetch(full, reply),
            Command::FetchCompleted { full, seq, result } => self.finish_fetch(full, seq, result),
            Command::DeferredRefetchDue => {
                self.refetch_pending = false;
                self.start_fetch(false, None);
            }
            Command::CreateLocal(session) => {
                let id = session.id;
                if self.store.insert_optimistic(session) {
                    debug!(session_id = %id, "Optimistic create");
                    self.publish(true);
                }
            }
            Command::ConfirmCreate(session) => {
                let id = session.id;
                let outcome = self.store.confirm_create(session);
                debug!(session_id = %id, ?outcome, "Create confirmed");
                self.publish(outcome.changed());
            }
            Command::CreateFailed(id) => {
                if self.store.discard_optimistic(id) {
                    warn!(session_id = %id, "Create rejected, optimistic record discarded");
                    self.publish(true);
                }
            }
            Command::DeleteLocal(id) => {
                if self.store.remove_local(id) {
                    self.reprocess.cancel(id);
                    debug!(session_id = %id, "Optimistic delete");
                    self.publish(true);
                }
            }
            Command::DeleteAcked(id) => self.store.acknowledge_delete(id),
            Command::DeleteFailed(id) => {
                if self.store.rollback_delete(id) {
                    warn!(session_id = %id, "Delete rejected, record restored");
                    self.publish(true);
                }
            }
            Command::SelectTemplate { id, template_id } => {
                if self.store.set_template(id, template_id) {
                    self.publish(true);
                } else {
                    debug!(session_id = %id, "Template selected for unknown session");
                }
            }
            Command::ApplyPatch(patch) => self.apply_update(patch),
            Command::BeginReprocess(id) => self.begin_reprocess(id),
            Command::EndReprocess(id) => {
                if self.reprocess.cancel(id) {
                    self.publish(false);
                }
            }
            Command::ReprocessDeadline { id, generation } => {
                if self.reprocess.expire(id, generation) {
                    info!(session_id = %id, "Re-processing not observed in time, flag cleared");
                    self.events.emit_lossy(ClientEvent::ReprocessingTimedOut {
                        session_id: id,
                        timestamp: Utc::now(),
                    });
                    self.publish(false);
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn apply_push(&mut self, event: ChangeEvent) {
        match event.entity_kind {
            EntityKind::Session => match event.operation {
                ChangeOperation::Insert => self.apply_insert(&event),
                ChangeOperation::Update => match event.row().map(SessionPatch::from_row) {
                    Some(Ok(patch)) => self.apply_update(patch),
                    Some(Err(e)) => self.malformed(&event, &e.to_string()),
                    None => self.malformed(&event, "update without row"),
                },
                ChangeOperation::Delete => match event.row_id() {
                    Some(id) => {
                        let outcome = self.store.apply_delete(id);
                        debug!(session_id = %id, ?outcome, "Push delete");
                        self.reprocess.cancel(id);
                        self.publish(outcome.changed());
                    }
                    None => self.malformed(&event, "delete without id"),
                },
            },
            EntityKind::Artifact(kind) => match event.session_ref() {
                Some(id) if self.store.contains(id) => {
                    trace!(session_id = %id, ?kind, "Artifact changed, scheduling re-fetch");
                    self.schedule_refetch();
                }
                _ => trace!(table = %event.source_table, "Artifact event for unknown session ignored"),
            },
            EntityKind::Other => {
                trace!(table = %event.source_table, "Event for unwatched table ignored")
            }
        }
    }

    fn apply_insert(&mut self, event: &ChangeEvent) {
        let session = match event.row().map(Session::from_row) {
            Some(Ok(session)) => session,
            Some(Err(e)) => return self.malformed(event, &e.to_string()),
            None => return self.malformed(event, "insert without row"),
        };
        let id = session.id;
        let outcome = self.store.apply_insert(session);
        match outcome {
            MergeOutcome::Inserted => {
                debug!(session_id = %id, "Push insert");
                self.schedule_refetch();
            }
            MergeOutcome::Suppressed => {
                debug!(session_id = %id, "Insert for deleted session ignored")
            }
            _ => debug!(session_id = %id, ?outcome, "Duplicate insert ignored"),
        }
        self.publish(outcome.changed());
    }

    fn apply_update(&mut self, patch: SessionPatch) {
        let id = patch.id;
        let outcome = self.store.apply_update(patch);
        match &outcome {
            MergeOutcome::Updated {
                status_rejected: true,
                previous,
                ..
            } => warn!(session_id = ?id, ?previous, "Illegal status regression ignored"),
            MergeOutcome::UnknownIgnored => {
                debug!(session_id = ?id, "Update for unknown session ignored")
            }
            MergeOutcome::Suppressed => {
                debug!(session_id = ?id, "Update for deleted session ignored")
            }
            MergeOutcome::Malformed(reason) => warn!(reason = %reason, "Malformed update"),
            _ => {}
        }

        if let Some(session) = id.and_then(|id| self.store.get(id)).cloned() {
            self.observe_reprocess(&session);
        }
        if outcome.completed_transition() {
            self.start_fetch(false, None);
        }
        self.publish(outcome.changed());
    }

    fn malformed(&mut self, event: &ChangeEvent, reason: &str) {
        warn!(table = %event.source_table, operation = ?event.operation, reason = %reason, "Malformed push event, scheduling corrective fetch");
        self.schedule_refetch();
    }

    fn schedule_refetch(&mut self) {
        if self.refetch_pending {
            return;
        }
        self.refetch_pending = true;
        let tx = self.tx.clone();
        let delay = self.refetch_delay;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Command::DeferredRefetchDue);
                }
            }
        });
    }

    fn start_fetch(&mut self, full: bool, reply: Option<FetchReply>) {
        if self.fetch_in_flight {
            let (pending_full, waiters) = self.follow_up.get_or_insert_with(|| (false, Vec::new()));
            *pending_full |= full;
            waiters.extend(reply);
            trace!("Fetch in flight, follow-up queued");
            return;
        }

        self.fetch_in_flight = true;
        self.waiters.extend(reply);
        let seq = self.store.begin_fetch();
        self.publish(false);

        let source = self.source.clone();
        let owner_id = self.owner_id.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = source.fetch_sessions(&owner_id) => result,
            };
            let _ = tx.send(Command::FetchCompleted { full, seq, result });
        });
    }

    fn finish_fetch(
        &mut self,
        full: bool,
        seq: u64,
        result: Result<Vec<Session>, TransportError>,
    ) {
        self.fetch_in_flight = false;
        let waiters = std::mem::take(&mut self.waiters);

        let reply = match result {
            Ok(sessions) => {
                let merge = self.store.merge_fetch(sessions, full, seq);
                debug!(owner = %self.owner_id, full, seq, ?merge, "Fetch merged");
                for id in self.reprocess.pending_ids() {
                    if let Some(session) = self.store.get(id).cloned() {
                        self.observe_reprocess(&session);
                    }
                }
                if let Some((follow_full, follow_waiters)) = self.follow_up.take() {
                    self.start_fetch(follow_full, None);
                    self.waiters.extend(follow_waiters);
                }
                self.publish(merge.changed() || full);
                Ok(())
            }
            Err(e) => {
                warn!(owner = %self.owner_id, error = %e, "Session fetch failed");
                self.events.emit_lossy(ClientEvent::FetchFailed {
                    owner_id: self.owner_id.clone(),
                    message: e.to_string(),
                    timestamp: Utc::now(),
                });
                if let Some((follow_full, follow_waiters)) = self.follow_up.take() {
                    self.start_fetch(follow_full, None);
                    self.waiters.extend(follow_waiters);
                }
                self.publish(false);
                Err(e)
            }
        };

        for waiter in waiters {
            let _ = waiter.send(reply.clone());
        }
    }

    fn begin_reprocess(&mut self, id: SessionId) {
        let Some(session) = self.store.get(id) else {
            warn!(session_id = %id, "Re-processing requested for unknown session");
            return;
        };
        let generation = self.reprocess.begin(session);
        info!(session_id = %id, "Re-processing started");
        self.events.emit_lossy(ClientEvent::ReprocessingStarted {
            session_id: id,
            timestamp: Utc::now(),
        });

        let tx = self.tx.clone();
        let timeout = self.reprocess.timeout();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(Command::ReprocessDeadline { id, generation });
                }
            }
        });
        self.publish(false);
    }

    fn observe_reprocess(&mut self, session: &Session) {
        match self.reprocess.observe(session) {
            ReprocessProgress::Finished(detected_by) => {
                info!(session_id = %session.id, ?detected_by, "Re-processing finished");
                self.events.emit_lossy(ClientEvent::ReprocessingFinished {
                    session_id: session.id,
                    detected_by,
                    timestamp: Utc::now(),
                });
            }
            ReprocessProgress::Abandoned(status) => {
                info!(session_id = %session.id, ?status, "Re-processing ended without completing");
            }
            ReprocessProgress::Waiting | ReprocessProgress::NotTracked => {}
        }
    }

    fn publish(&mut self, changed: bool) {
        self.snapshot.send_replace(SessionSnapshot {
            sessions: Arc::new(self.store.sessions().to_vec()),
            loading: self.fetch_in_flight,
            loaded: self.store.is_loaded(),
            reprocessing: Arc::new(self.reprocess.pending_ids()),
        });
        if changed {
            self.events.emit_lossy(ClientEvent::SessionsChanged {
                owner_id: self.owner_id.clone(),
                count: self.store.len(),
                timestamp: Utc::now(),
            });
        }
    }
}
