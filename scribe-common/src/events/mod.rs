//! Client notification events
//!
//! Provides the `ClientEvent` enum and the `EventBus` used by the sync
//! components to tell the UI layer what happened (job progress, collection
//! changes, re-processing outcomes, channel health).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::{ChannelState, JobStatus, SessionId};

/// Final outcome of a polled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    AuthExpired,
    /// Caller abandoned the job before a terminal state
    Aborted,
    /// Poll request error surfaced to the caller
    Error,
}

/// How the end of a re-processing cycle was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReprocessDetection {
    /// `processing` then `completed` were both observed
    StatusTransition,
    /// `completed` observed with a changed content signature
    SignatureChange,
}

/// Scribe client events
///
/// Events are broadcast via EventBus and can be serialized for forwarding to
/// a UI process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// A poll response was observed for a job
    JobProgress {
        job_id: String,
        status: JobStatus,
        progress: Option<Value>,
        /// 1-based poll attempt that produced this status
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// Poller stopped for a job
    JobFinished {
        job_id: String,
        outcome: JobOutcome,
        timestamp: DateTime<Utc>,
    },

    /// Canonical session collection changed
    SessionsChanged {
        owner_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// User asked for a session to be re-processed
    ReprocessingStarted {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// Re-processing finished (success notification)
    ReprocessingFinished {
        session_id: SessionId,
        detected_by: ReprocessDetection,
        timestamp: DateTime<Utc>,
    },

    /// Re-processing flag force-cleared without observing completion
    ReprocessingTimedOut {
        session_id: SessionId,
        timestamp: DateTime<Utc>,
    },

    /// Push channel changed lifecycle state
    ChannelStateChanged {
        name: String,
        owner_key: String,
        state: ChannelState,
        timestamp: DateTime<Utc>,
    },

    /// Push channel dropped from tracking
    ChannelRemoved {
        name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Consumer became visible/hidden
    ActivityChanged {
        active: bool,
        timestamp: DateTime<Utc>,
    },

    /// Bulk fetch failed (collection left as it was)
    FetchFailed {
        owner_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for `ClientEvent`s
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use scribe_common::events::{ClientEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(ClientEvent::ActivityChanged {
///     active: false,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(
///     rx.try_recv(),
///     Ok(ClientEvent::ActivityChanged { active: false, .. })
/// ));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ClientEvent,
    ) -> Result<usize, broadcast::error::SendError<ClientEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
