//! Error types for scribe-sync
//!
//! Each component keeps its own error enum; `ClientError` is what crosses
//! into the facade and the binary.

use scribe_common::model::SessionId;
use thiserror::Error;

use crate::channels::ChannelError;
use crate::poller::PollError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Job submission/polling gave up (auth expired, failed, cancelled,
    /// timed out)
    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(#[from] scribe_common::Error),

    #[error("Session not found: {0}")]
    NotFound(SessionId),
}

impl ClientError {
    /// The credential was rejected or is known to be expired
    pub fn is_auth_expired(&self) -> bool {
        match self {
            ClientError::Poll(PollError::AuthExpired { .. }) => true,
            ClientError::Transport(e) | ClientError::Poll(PollError::Transport(e)) => {
                e.is_auth_failure()
            }
            _ => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
