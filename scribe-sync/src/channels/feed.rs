//! Change-feed abstraction consumed by the channel manager

use async_trait::async_trait;
use scribe_common::model::{ChangeEvent, ChannelState};
use tokio::sync::mpsc;

use super::ChannelError;

/// One item delivered by a feed subscription
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Subscription lifecycle change
    State(ChannelState),
    /// Row change
    Event(ChangeEvent),
}

/// What to subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionRequest {
    /// Unique channel name (dedupe key)
    pub name: String,
    /// Owner the channel belongs to (user id)
    pub owner_key: String,
    /// Source table watched by the channel
    pub table: String,
}

impl SubscriptionRequest {
    pub fn new(
        name: impl Into<String>,
        owner_key: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            owner_key: owner_key.into(),
            table: table.into(),
        }
    }
}

/// A source of push change events
///
/// `subscribe` starts the handshake and returns immediately; the feed reports
/// `State(Subscribed)` once the backend acknowledges, then `Event`s. The
/// receiver closing is treated like `State(Closed)`.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<mpsc::Receiver<FeedMessage>, ChannelError>;

    async fn unsubscribe(&self, name: &str) -> Result<(), ChannelError>;
}
