//! Push-channel lifecycle states

use serde::{Deserialize, Serialize};

/// Subscription lifecycle of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Handshake in progress
    Connecting,
    /// Handshake acknowledged, events flowing
    Subscribed,
    /// Feed reported an error
    Error,
    /// Handshake or heartbeat timed out
    TimedOut,
    /// Feed closed the subscription
    Closed,
}

impl ChannelState {
    /// States after which the channel is dropped from tracking
    pub fn is_dead(self) -> bool {
        matches!(
            self,
            ChannelState::Error | ChannelState::TimedOut | ChannelState::Closed
        )
    }
}
