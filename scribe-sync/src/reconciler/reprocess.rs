//! Re-processing completion detection
//!
//! Best effort and time-bounded. A re-processed session often reports
//! `completed` before the backend has flipped it to `processing` (a stale
//! echo of the previous run), so `completed` alone proves nothing. A request
//! counts as finished once `processing` has been seen since it began, or once
//! the transcript signature differs from the one captured at the start.
//! Requests that see neither are force-cleared by the caller after a timeout.

use scribe_common::events::ReprocessDetection;
use scribe_common::model::{ContentSignature, Session, SessionId, SessionStatus};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct PendingReprocess {
    baseline: ContentSignature,
    started_at: Instant,
    saw_processing: bool,
    generation: u64,
}

/// What an observation meant for a tracked request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReprocessProgress {
    NotTracked,
    /// Still waiting (includes stale `completed` echoes)
    Waiting,
    Finished(ReprocessDetection),
    /// Session ended as failed or cancelled
    Abandoned(SessionStatus),
}

#[derive(Debug)]
pub struct ReprocessTracker {
    pending: HashMap<SessionId, PendingReprocess>,
    timeout: Duration,
    next_generation: u64,
}

impl ReprocessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            next_generation: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start tracking; returns the generation the deadline must quote
    ///
    /// Beginning again for a tracked session restarts it with a fresh
    /// baseline, which invalidates the earlier deadline.
    pub fn begin(&mut self, session: &Session) -> u64 {
        self.next_generation += 1;
        self.pending.insert(
            session.id,
            PendingReprocess {
                baseline: session.content_signature(),
                started_at: Instant::now(),
                saw_processing: session.status == SessionStatus::Processing,
                generation: self.next_generation,
            },
        );
        self.next_generation
    }

    pub fn observe(&mut self, session: &Session) -> ReprocessProgress {
        let Some(pending) = self.pending.get_mut(&session.id) else {
            return ReprocessProgress::NotTracked;
        };

        let progress = match session.status {
            SessionStatus::Processing => {
                pending.saw_processing = true;
                ReprocessProgress::Waiting
            }
            SessionStatus::Completed if pending.saw_processing => {
                ReprocessProgress::Finished(ReprocessDetection::StatusTransition)
            }
            SessionStatus::Completed if session.content_signature() != pending.baseline => {
                ReprocessProgress::Finished(ReprocessDetection::SignatureChange)
            }
            SessionStatus::Failed | SessionStatus::Cancelled => {
                ReprocessProgress::Abandoned(session.status)
            }
            _ => ReprocessProgress::Waiting,
        };

        if matches!(
            progress,
            ReprocessProgress::Finished(_) | ReprocessProgress::Abandoned(_)
        ) {
            self.pending.remove(&session.id);
        }
        progress
    }

    /// Deadline for `generation` reached; true when this cleared the flag
    pub fn expire(&mut self, id: SessionId, generation: u64) -> bool {
        match self.pending.get(&id) {
            Some(pending) if pending.generation == generation => {
                self.pending.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, id: SessionId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: SessionId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_ids(&self) -> HashSet<SessionId> {
        self.pending.keys().copied().collect()
    }

    pub fn elapsed(&self, id: SessionId) -> Option<Duration> {
        self.pending.get(&id).map(|p| p.started_at.elapsed())
    }
}
