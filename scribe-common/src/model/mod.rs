//! Data model shared between the sync components

mod change;
mod channel;
mod job;
mod session;

pub use change::{ChangeEvent, ChangeOperation, EntityKind, SESSIONS_TABLE};
pub use channel::ChannelState;
pub use job::{Job, JobStatus, JobStatusResponse, JobTicket};
pub use session::{
    Artifact, ArtifactKind, ContentSignature, RecordOrigin, Session, SessionArtifacts,
    SessionId, SessionPatch, SessionStatus,
};
