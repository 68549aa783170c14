//! Canonical session collection and its merge rules
//!
//! Pure, synchronous state: every input (push event, bulk fetch, local
//! write) is folded in by id so that duplicates and reorderings converge.

use scribe_common::model::{RecordOrigin, Session, SessionId, SessionPatch, SessionStatus};
use std::collections::{HashMap, HashSet};

/// Why a deleted id is remembered
#[derive(Debug, Clone, PartialEq)]
pub enum Tombstone {
    /// Removed locally, backend has not acknowledged yet
    PendingLocal { removed: Session, position: usize },
    /// Deletion known to the backend; only a fetch started after `stamp`
    /// may re-admit the id
    Confirmed { stamp: u64 },
}

/// Result of folding one input into the store
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Inserted,
    /// Id already present; `confirmed` is true when this upgraded an
    /// optimistic record
    DuplicateIgnored { confirmed: bool },
    Updated {
        previous: SessionStatus,
        current: SessionStatus,
        /// Patch carried an illegal status regression that was not applied
        status_rejected: bool,
    },
    UnknownIgnored,
    Deleted,
    AlreadyAbsent,
    /// Deleted id; late push ignored
    Suppressed,
    Malformed(String),
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted
                | MergeOutcome::Updated { .. }
                | MergeOutcome::Deleted
                | MergeOutcome::DuplicateIgnored { confirmed: true }
        )
    }

    /// The update moved a session into `completed`
    pub fn completed_transition(&self) -> bool {
        matches!(
            self,
            MergeOutcome::Updated { previous, current: SessionStatus::Completed, .. }
                if *previous != SessionStatus::Completed
        )
    }
}

/// Counts from one bulk fetch merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchMerge {
    pub upserted: usize,
    pub removed: usize,
    /// Rows skipped because of a tombstone the fetch does not supersede
    pub suppressed: usize,
    /// Confirmed tombstones dropped because the backend no longer returns them
    pub pruned: usize,
}

impl FetchMerge {
    pub fn changed(&self) -> bool {
        self.upserted > 0 || self.removed > 0
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Vec<Session>,
    tombstones: HashMap<SessionId, Tombstone>,
    /// Sequence of the most recently started fetch
    fetch_seq: u64,
    loaded: bool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> HashSet<SessionId> {
        self.sessions.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Initial full load has completed
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn tombstone(&self, id: SessionId) -> Option<&Tombstone> {
        self.tombstones.get(&id)
    }

    /// Sequence number for a fetch that is about to start
    pub fn begin_fetch(&mut self) -> u64 {
        self.fetch_seq += 1;
        self.fetch_seq
    }

    fn confirmed(&self) -> Tombstone {
        Tombstone::Confirmed {
            stamp: self.fetch_seq,
        }
    }

    fn position(&self, id: SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    /// Push insert
    pub fn apply_insert(&mut self, session: Session) -> MergeOutcome {
        if self.tombstones.contains_key(&session.id) {
            return MergeOutcome::Suppressed;
        }
        if let Some(existing) = self.sessions.iter_mut().find(|s| s.id == session.id) {
            let confirmed = existing.origin == RecordOrigin::Optimistic;
            existing.origin = RecordOrigin::Authoritative;
            return MergeOutcome::DuplicateIgnored { confirmed };
        }
        let mut session = session;
        session.origin = RecordOrigin::Authoritative;
        self.sessions.insert(0, session);
        MergeOutcome::Inserted
    }

    /// Push update (or local patch): shallow merge of present fields
    pub fn apply_update(&mut self, patch: SessionPatch) -> MergeOutcome {
        let Some(id) = patch.id else {
            return MergeOutcome::Malformed("update without id".to_string());
        };
        if self.tombstones.contains_key(&id) {
            return MergeOutcome::Suppressed;
        }
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return MergeOutcome::UnknownIgnored;
        };

        let previous = session.status;
        let mut status_rejected = false;
        if let Some(status) = patch.status {
            if previous.can_transition_to(status) {
                session.status = status;
            } else {
                status_rejected = true;
            }
        }
        if let Some(owner_id) = patch.owner_id {
            session.owner_id = owner_id;
        }
        if let Some(title) = patch.title {
            session.title = title;
        }
        if let Some(updated_at) = patch.updated_at {
            session.updated_at = updated_at;
        }
        if let Some(duration_seconds) = patch.duration_seconds {
            session.duration_seconds = duration_seconds;
        }
        if let Some(template_id) = patch.template_id {
            session.template_id = template_id;
        }
        session.origin = RecordOrigin::Authoritative;

        MergeOutcome::Updated {
            previous,
            current: session.status,
            status_rejected,
        }
    }

    /// Push delete: unconditional, remembered
    pub fn apply_delete(&mut self, id: SessionId) -> MergeOutcome {
        let tombstone = self.confirmed();
        self.tombstones.insert(id, tombstone);
        match self.position(id) {
            Some(pos) => {
                self.sessions.remove(pos);
                MergeOutcome::Deleted
            }
            None => MergeOutcome::AlreadyAbsent,
        }
    }

    /// Fold a bulk fetch in by id
    ///
    /// `seq` is the value [`begin_fetch`](Self::begin_fetch) returned when the
    /// fetch started. A confirmed delete is only overridden by a fetch that
    /// started after it; older fetches may carry rows from before the delete.
    ///
    /// `full` is only used for the initial load: records missing from the
    /// fetch are dropped, except optimistic ones not yet confirmed.
    pub fn merge_fetch(&mut self, fetched: Vec<Session>, full: bool, seq: u64) -> FetchMerge {
        let mut merge = FetchMerge::default();
        let mut seen = HashSet::with_capacity(fetched.len());

        for mut session in fetched {
            match self.tombstones.get(&session.id) {
                Some(Tombstone::PendingLocal { .. }) => {
                    merge.suppressed += 1;
                    continue;
                }
                Some(Tombstone::Confirmed { stamp }) if seq <= *stamp => {
                    merge.suppressed += 1;
                    continue;
                }
                Some(Tombstone::Confirmed { .. }) => {
                    // Backend still has it after the delete
                    self.tombstones.remove(&session.id);
                }
                None => {}
            }

            seen.insert(session.id);
            session.origin = RecordOrigin::Authoritative;
            match self.sessions.iter_mut().find(|s| s.id == session.id) {
                Some(existing) => {
                    if session.template_id.is_none() {
                        session.template_id = existing.template_id.clone();
                    }
                    if *existing != session {
                        merge.upserted += 1;
                    }
                    *existing = session;
                }
                None => {
                    merge.upserted += 1;
                    self.sessions.push(session);
                }
            }
        }

        let before = self.tombstones.len();
        self.tombstones.retain(|id, tombstone| match tombstone {
            Tombstone::Confirmed { stamp } => *stamp >= seq,
            Tombstone::PendingLocal { .. } => true,
        });
        merge.pruned = before - self.tombstones.len();

        if full {
            let before = self.sessions.len();
            self.sessions
                .retain(|s| seen.contains(&s.id) || s.origin == RecordOrigin::Optimistic);
            merge.removed = before - self.sessions.len();
            self.loaded = true;
        }

        self.sessions
            .sort_by(|a, b| b.created_at.cmp(&a.created_at));
        merge
    }

    /// Optimistic create, ahead of the backend write
    pub fn insert_optimistic(&mut self, mut session: Session) -> bool {
        if self.contains(session.id) {
            return false;
        }
        session.origin = RecordOrigin::Optimistic;
        self.sessions.insert(0, session);
        true
    }

    /// Backend accepted a create: replace the optimistic copy
    pub fn confirm_create(&mut self, mut session: Session) -> MergeOutcome {
        if self.tombstones.contains_key(&session.id) {
            return MergeOutcome::Suppressed;
        }
        session.origin = RecordOrigin::Authoritative;
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => {
                *existing = session;
                MergeOutcome::DuplicateIgnored { confirmed: true }
            }
            None => {
                self.sessions.insert(0, session);
                MergeOutcome::Inserted
            }
        }
    }

    /// Backend rejected a create: drop the optimistic copy
    pub fn discard_optimistic(&mut self, id: SessionId) -> bool {
        match self.position(id) {
            Some(pos) if self.sessions[pos].origin == RecordOrigin::Optimistic => {
                self.sessions.remove(pos);
                true
            }
            _ => false,
        }
    }

    /// Optimistic delete, ahead of the backend write
    pub fn remove_local(&mut self, id: SessionId) -> bool {
        let Some(position) = self.position(id) else {
            return false;
        };
        let removed = self.sessions.remove(position);
        self.tombstones
            .insert(id, Tombstone::PendingLocal { removed, position });
        true
    }

    pub fn acknowledge_delete(&mut self, id: SessionId) {
        let tombstone = self.confirmed();
        self.tombstones.insert(id, tombstone);
    }

    /// Backend rejected a delete: restore the record where it was
    pub fn rollback_delete(&mut self, id: SessionId) -> bool {
        match self.tombstones.remove(&id) {
            Some(Tombstone::PendingLocal { removed, position }) => {
                let position = position.min(self.sessions.len());
                self.sessions.insert(position, removed);
                true
            }
            Some(other) => {
                self.tombstones.insert(id, other);
                false
            }
            None => false,
        }
    }

    /// Local template selection
    pub fn set_template(&mut self, id: SessionId, template_id: Option<String>) -> bool {
        match self.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.template_id = template_id;
                true
            }
            None => false,
        }
    }
}
