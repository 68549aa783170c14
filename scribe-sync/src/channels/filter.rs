//! Client-side event filters

use scribe_common::model::{ChangeEvent, SessionId};
use std::collections::HashSet;

/// Which events a channel delivers
///
/// A `Sessions` filter is a snapshot of ids taken when the channel was
/// created; it does not follow later changes to the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelFilter {
    #[default]
    All,
    Sessions(HashSet<SessionId>),
}

impl ChannelFilter {
    pub fn sessions(ids: impl IntoIterator<Item = SessionId>) -> Self {
        ChannelFilter::Sessions(ids.into_iter().collect())
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        match self {
            ChannelFilter::All => true,
            ChannelFilter::Sessions(ids) => event
                .session_ref()
                .map(|id| ids.contains(&id))
                .unwrap_or(false),
        }
    }

    /// True when `ids` holds an id the snapshot does not cover
    ///
    /// Ids that disappeared are harmless (their events just stop arriving),
    /// so only additions force a rebuild.
    pub fn needs_rebuild(&self, ids: &HashSet<SessionId>) -> bool {
        match self {
            ChannelFilter::All => false,
            ChannelFilter::Sessions(snapshot) => !ids.is_subset(snapshot),
        }
    }
}
