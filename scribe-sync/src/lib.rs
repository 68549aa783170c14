//! scribe-sync library interface
//!
//! Client-side orchestration for a recording/transcription backend:
//! - `transport`: authenticated HTTP calls with hard timeouts
//! - `poller`: submit-and-poll for long-running backend jobs
//! - `channels`: push subscription table with automatic cleanup
//! - `reconciler`: one canonical session collection from push, fetch and
//!   local writes
//! - `client`: the per-owner facade wiring the above together

pub mod channels;
pub mod client;
pub mod error;
pub mod poller;
pub mod reconciler;
pub mod transport;

pub use crate::client::{SyncClient, SyncParts};
pub use crate::error::{ClientError, ClientResult};
