//! Event channel manager
//!
//! Owns the table of live push subscriptions ("channels") for one client.
//! Channels are keyed by name and created idempotently: a second create for a
//! tracked name returns the existing channel without opening another
//! subscription. Each channel runs a pump task that forwards feed events to
//! its handler and removes the channel from the table when the feed reports
//! `error`, `timed_out` or `closed`.
//!
//! The table is an explicitly constructed value owned by the client, never a
//! process global.

mod feed;
mod filter;
mod sse;

pub use feed::{ChangeFeed, FeedMessage, SubscriptionRequest};
pub use filter::ChannelFilter;
pub use sse::{SseChangeFeed, SseFrame, SseParser};

use chrono::Utc;
use scribe_common::config::ChannelSettings;
use scribe_common::events::{ClientEvent, EventBus};
use scribe_common::model::{ChangeEvent, ChannelState, SessionId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Channel errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("Subscription handshake for channel '{name}' timed out after {timeout_ms}ms")]
    HandshakeTimeout { name: String, timeout_ms: u64 },

    #[error("Subscribe failed for channel '{name}': {message}")]
    Subscribe { name: String, message: String },

    #[error("Unsubscribe failed for channel '{name}': {message}")]
    Unsubscribe { name: String, message: String },

    #[error("Channel '{0}' is not tracked")]
    NotTracked(String),

    /// Channel died before (or after) the handshake completed
    #[error("Channel '{name}' ended in state {state:?}")]
    Ended { name: String, state: ChannelState },
}

/// Callback receiving the events a channel delivers
pub type EventHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Handle to one tracked channel
#[derive(Clone)]
pub struct Channel {
    pub name: String,
    pub owner_key: String,
    pub table: String,
    instance: Uuid,
    handshake_timeout: Duration,
    state: watch::Receiver<ChannelState>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("owner_key", &self.owner_key)
            .field("table", &self.table)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Identifies this subscription; a rebuilt channel with the same name
    /// gets a new instance id
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Wait for the handshake to finish
    ///
    /// # Errors
    /// - `HandshakeTimeout` when the feed did not acknowledge in time
    /// - `Ended` when the channel died for another reason
    pub async fn ready(&self) -> Result<(), ChannelError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| *s == ChannelState::Subscribed || s.is_dead())
            .await
            .map(|s| *s)
            .unwrap_or(ChannelState::Closed);
        match settled {
            ChannelState::Subscribed => Ok(()),
            ChannelState::TimedOut => Err(ChannelError::HandshakeTimeout {
                name: self.name.clone(),
                timeout_ms: self.handshake_timeout.as_millis() as u64,
            }),
            state => Err(ChannelError::Ended {
                name: self.name.clone(),
                state,
            }),
        }
    }
}

/// Snapshot of the channel table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelHealth {
    pub active: usize,
    pub names: Vec<String>,
    pub per_owner: BTreeMap<String, usize>,
    /// Owners holding more channels than the warning threshold
    pub warnings: Vec<String>,
}

struct TrackedChannel {
    channel: Channel,
    filter: ChannelFilter,
    cancel: CancellationToken,
}

struct Inner {
    feed: Arc<dyn ChangeFeed>,
    channels: Mutex<HashMap<String, TrackedChannel>>,
    active: AtomicBool,
    events: EventBus,
    handshake_timeout: Duration,
    warn_threshold: usize,
}

/// How a pump stopped
enum PumpExit {
    /// Removed by the manager
    Cancelled,
    Dead { state: ChannelState, reason: String },
}

#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, settings: &ChannelSettings, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                feed,
                channels: Mutex::new(HashMap::new()),
                active: AtomicBool::new(true),
                events,
                handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
                warn_threshold: settings.owner_channel_warn_threshold,
            }),
        }
    }

    /// Create a channel, or return the tracked one with the same name
    ///
    /// The entry is reserved before the handshake starts, so concurrent
    /// creates for one name share a single subscription. Must be called
    /// from within a tokio runtime.
    pub fn create_channel(
        &self,
        request: SubscriptionRequest,
        filter: ChannelFilter,
        handler: EventHandler,
    ) -> Channel {
        let mut channels = self.inner.table();
        if let Some(existing) = channels.get(&request.name) {
            debug!(channel = %request.name, "Channel already tracked, reusing");
            return existing.channel.clone();
        }

        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let channel = Channel {
            name: request.name.clone(),
            owner_key: request.owner_key.clone(),
            table: request.table.clone(),
            instance: Uuid::new_v4(),
            handshake_timeout: self.inner.handshake_timeout,
            state: state_rx,
        };
        let cancel = CancellationToken::new();
        channels.insert(
            request.name.clone(),
            TrackedChannel {
                channel: channel.clone(),
                filter: filter.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(channels);

        info!(channel = %request.name, owner = %request.owner_key, table = %request.table, "Creating channel");
        self.inner.emit_state(&channel, ChannelState::Connecting);

        let inner = self.inner.clone();
        let pumped = channel.clone();
        tokio::spawn(async move {
            let exit = inner
                .clone()
                .pump(&request, &pumped, &filter, &handler, &state_tx, &cancel)
                .await;
            match exit {
                PumpExit::Cancelled => {
                    state_tx.send_replace(ChannelState::Closed);
                }
                PumpExit::Dead { state, reason } => {
                    state_tx.send_replace(state);
                    inner.retire(&pumped, state, &reason).await;
                }
            }
        });

        channel
    }

    /// Unsubscribe and untrack a channel
    ///
    /// The channel is untracked even when the feed fails to unsubscribe.
    /// Returns false when no channel with this name was tracked.
    pub async fn remove_channel(&self, name: &str) -> bool {
        let Some(tracked) = self.inner.table().remove(name) else {
            debug!(channel = %name, "Remove of untracked channel ignored");
            return false;
        };
        tracked.cancel.cancel();
        if let Err(e) = self.inner.feed.unsubscribe(name).await {
            warn!(channel = %name, error = %e, "Unsubscribe failed, channel untracked anyway");
        }
        info!(channel = %name, "Channel removed");
        self.inner.events.emit_lossy(ClientEvent::ChannelRemoved {
            name: name.to_string(),
            reason: "removed".to_string(),
            timestamp: Utc::now(),
        });
        true
    }

    /// Tear down every tracked channel
    pub async fn cleanup_all(&self) {
        let names: Vec<String> = self.inner.table().keys().cloned().collect();
        if !names.is_empty() {
            info!(count = names.len(), "Cleaning up all channels");
        }
        for name in names {
            self.remove_channel(&name).await;
        }
    }

    /// Tear down every channel belonging to `owner_key`
    pub async fn remove_owner_channels(&self, owner_key: &str) -> usize {
        let names: Vec<String> = self
            .inner
            .table()
            .values()
            .filter(|t| t.channel.owner_key == owner_key)
            .map(|t| t.channel.name.clone())
            .collect();
        let mut removed = 0;
        for name in names {
            if self.remove_channel(&name).await {
                removed += 1;
            }
        }
        removed
    }

    /// Keep a session-scoped channel's filter covering `ids`
    ///
    /// The tracked channel is reused while its snapshot still covers every
    /// id; otherwise it is removed and created again with the new set.
    pub async fn ensure_session_channel(
        &self,
        request: SubscriptionRequest,
        ids: &HashSet<SessionId>,
        handler: EventHandler,
    ) -> Channel {
        let stale = {
            let channels = self.inner.table();
            match channels.get(&request.name) {
                Some(tracked) if !tracked.filter.needs_rebuild(ids) => {
                    return tracked.channel.clone();
                }
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            debug!(channel = %request.name, ids = ids.len(), "Session set grew, rebuilding channel");
            self.remove_channel(&request.name).await;
        }
        self.create_channel(request, ChannelFilter::Sessions(ids.clone()), handler)
    }

    /// Gate delivery on consumer visibility
    ///
    /// Returns the previous value.
    pub fn set_active(&self, active: bool) -> bool {
        let previous = self.inner.active.swap(active, Ordering::SeqCst);
        if previous != active {
            debug!(active, "Channel delivery gate changed");
            self.inner.events.emit_lossy(ClientEvent::ActivityChanged {
                active,
                timestamp: Utc::now(),
            });
        }
        previous
    }

    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.table().get(name).map(|t| t.channel.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.table().len()
    }

    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.table().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn health(&self) -> ChannelHealth {
        let mut health = ChannelHealth::default();
        {
            let channels = self.inner.table();
            health.active = channels.len();
            for tracked in channels.values() {
                health.names.push(tracked.channel.name.clone());
                *health
                    .per_owner
                    .entry(tracked.channel.owner_key.clone())
                    .or_insert(0) += 1;
            }
        }
        health.names.sort();

        for (owner, count) in &health.per_owner {
            if *count > self.inner.warn_threshold {
                warn!(owner = %owner, count, threshold = self.inner.warn_threshold, "Owner holds too many channels");
                health.warnings.push(format!(
                    "owner {} holds {} channels (threshold {})",
                    owner, count, self.inner.warn_threshold
                ));
            }
        }
        health
    }
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<String, TrackedChannel>> {
        // A panicked holder cannot leave the map half-updated
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_state(&self, channel: &Channel, state: ChannelState) {
        self.events.emit_lossy(ClientEvent::ChannelStateChanged {
            name: channel.name.clone(),
            owner_key: channel.owner_key.clone(),
            state,
            timestamp: Utc::now(),
        });
    }

    async fn pump(
        self: Arc<Self>,
        request: &SubscriptionRequest,
        channel: &Channel,
        filter: &ChannelFilter,
        handler: &EventHandler,
        state_tx: &watch::Sender<ChannelState>,
        cancel: &CancellationToken,
    ) -> PumpExit {
        let deadline = tokio::time::Instant::now() + self.handshake_timeout;
        let handshake_timed_out = || PumpExit::Dead {
            state: ChannelState::TimedOut,
            reason: ChannelError::HandshakeTimeout {
                name: request.name.clone(),
                timeout_ms: self.handshake_timeout.as_millis() as u64,
            }
            .to_string(),
        };

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            subscribed = tokio::time::timeout_at(deadline, self.feed.subscribe(request)) => subscribed,
        };
        let mut rx: mpsc::Receiver<FeedMessage> = match subscribed {
            Err(_) => return handshake_timed_out(),
            Ok(Err(e)) => {
                return PumpExit::Dead {
                    state: ChannelState::Error,
                    reason: e.to_string(),
                }
            }
            Ok(Ok(rx)) => rx,
        };

        let mut acknowledged = false;
        loop {
            let message = if acknowledged {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PumpExit::Cancelled,
                    message = rx.recv() => message,
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return PumpExit::Cancelled,
                    message = tokio::time::timeout_at(deadline, rx.recv()) => match message {
                        Ok(message) => message,
                        Err(_) => return handshake_timed_out(),
                    },
                }
            };

            match message {
                None => {
                    return PumpExit::Dead {
                        state: ChannelState::Closed,
                        reason: "feed closed".to_string(),
                    }
                }
                Some(FeedMessage::State(state)) if state.is_dead() => {
                    return PumpExit::Dead {
                        state,
                        reason: format!("feed reported {:?}", state),
                    }
                }
                Some(FeedMessage::State(state)) => {
                    if state == ChannelState::Subscribed && !acknowledged {
                        acknowledged = true;
                        info!(channel = %channel.name, "Channel subscribed");
                    }
                    state_tx.send_replace(state);
                    self.emit_state(channel, state);
                }
                Some(FeedMessage::Event(event)) => self.deliver(channel, filter, handler, event),
            }
        }
    }

    fn deliver(
        &self,
        channel: &Channel,
        filter: &ChannelFilter,
        handler: &EventHandler,
        event: ChangeEvent,
    ) {
        if !filter.accepts(&event) {
            trace!(channel = %channel.name, table = %event.source_table, "Event outside channel filter dropped");
            return;
        }
        if !self.active.load(Ordering::SeqCst) {
            trace!(channel = %channel.name, table = %event.source_table, "Event dropped while inactive");
            return;
        }
        handler(event);
    }

    /// Drop a dead channel from the table
    ///
    /// Only the entry created by this pump is removed; a successor created
    /// under the same name after a rebuild is left alone.
    async fn retire(&self, channel: &Channel, state: ChannelState, reason: &str) {
        self.emit_state(channel, state);
        let removed = {
            let mut channels = self.table();
            match channels.get(&channel.name) {
                Some(tracked) if tracked.channel.instance == channel.instance => {
                    channels.remove(&channel.name)
                }
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        warn!(channel = %channel.name, ?state, reason = %reason, "Channel died, removed from tracking");
        if let Err(e) = self.feed.unsubscribe(&channel.name).await {
            debug!(channel = %channel.name, error = %e, "Unsubscribe of dead channel failed");
        }
        self.events.emit_lossy(ClientEvent::ChannelRemoved {
            name: channel.name.clone(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}
