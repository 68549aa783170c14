//! # Scribe Common Library
//!
//! Shared code for the scribe client crates including:
//! - Session, change-event and job models
//! - Client notification events (ClientEvent enum) and the EventBus
//! - Configuration loading
//! - Common error type

pub mod config;
pub mod error;
pub mod events;
pub mod model;

pub use error::{Error, Result};
