//! Session records and their attached artifact sub-collections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// Session identifier
pub type SessionId = Uuid;

/// Recording session lifecycle
///
/// Transitions are monotonic by [`SessionStatus::rank`] with one exception:
/// a terminal session may go back to `Processing` when re-processing is
/// triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Row exists, nothing recorded yet
    Created,
    /// Audio capture in progress
    Recording,
    /// Transcription/summary pipeline running
    Processing,
    /// Pipeline finished
    Completed,
    /// Pipeline failed
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl SessionStatus {
    /// Ordering used for monotonic transition checks
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Created => 0,
            SessionStatus::Recording => 1,
            SessionStatus::Processing => 2,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        if next.rank() >= self.rank() {
            return true;
        }
        // Re-processing: completed/failed go back through processing
        matches!(
            (self, next),
            (SessionStatus::Completed, SessionStatus::Processing)
                | (SessionStatus::Failed, SessionStatus::Processing)
        )
    }
}

/// Where the current copy of a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Created locally ahead of any backend confirmation
    Optimistic,
    /// Confirmed by a bulk fetch or a push event
    #[default]
    Authoritative,
}

/// Sub-collection kinds attached to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Audio,
    Transcript,
    Summary,
}

impl ArtifactKind {
    /// Backing table name in the change feed
    pub fn table(self) -> &'static str {
        match self {
            ArtifactKind::Audio => "audio_files",
            ArtifactKind::Transcript => "transcripts",
            ArtifactKind::Summary => "summaries",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        match table {
            "audio_files" => Some(ArtifactKind::Audio),
            "transcripts" => Some(ArtifactKind::Transcript),
            "summaries" => Some(ArtifactKind::Summary),
            _ => None,
        }
    }
}

/// One attached artifact row (audio file, transcript or summary)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// When this copy was fetched by the client
    #[serde(default = "Utc::now")]
    pub fetched_at: DateTime<Utc>,
}

impl Artifact {
    pub fn content_length(&self) -> usize {
        self.content.as_ref().map_or(0, |c| c.len())
    }
}

/// Independently fetched sub-collections of a session
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionArtifacts {
    #[serde(default)]
    pub audio: Vec<Artifact>,
    #[serde(default)]
    pub transcripts: Vec<Artifact>,
    #[serde(default)]
    pub summaries: Vec<Artifact>,
}

impl SessionArtifacts {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.transcripts.is_empty() && self.summaries.is_empty()
    }
}

/// Small fingerprint of a session's transcript content
///
/// Used to notice that re-processing produced new content even when the
/// intermediate `processing` status was never observed. Best effort only:
/// re-processing that yields byte-identical transcripts is invisible to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSignature {
    pub primary_id: Option<String>,
    pub content_length: usize,
    pub count: usize,
}

/// Canonical session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    #[serde(alias = "user_id")]
    pub owner_id: String,
    #[serde(default)]
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(flatten)]
    pub artifacts: SessionArtifacts,
    #[serde(skip)]
    pub origin: RecordOrigin,
}

impl Session {
    /// Build a locally created record ahead of backend confirmation
    pub fn optimistic(owner_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            title: title.into(),
            status: SessionStatus::Created,
            created_at: Utc::now(),
            updated_at: None,
            duration_seconds: None,
            template_id: None,
            artifacts: SessionArtifacts::default(),
            origin: RecordOrigin::Optimistic,
        }
    }

    /// Decode a full row (bulk fetch or push insert payload)
    pub fn from_row(row: &Value) -> Result<Self> {
        serde_json::from_value(row.clone())
            .map_err(|e| Error::Parse(format!("session row: {}", e)))
    }

    pub fn content_signature(&self) -> ContentSignature {
        let transcripts = &self.artifacts.transcripts;
        ContentSignature {
            primary_id: transcripts.first().map(|t| t.id.clone()),
            content_length: transcripts.iter().map(Artifact::content_length).sum(),
            count: transcripts.len(),
        }
    }
}

/// Partial session row carried by push updates
///
/// Only fields present in the payload are `Some`; merging copies those and
/// leaves everything else untouched. Nullable columns use a nested option so
/// that an explicit `null` (`Some(None)`) clears the field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionPatch {
    #[serde(default)]
    pub id: Option<SessionId>,
    #[serde(default, alias = "user_id")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<SessionStatus>,
    #[serde(default, deserialize_with = "present")]
    pub updated_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present")]
    pub duration_seconds: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub template_id: Option<Option<String>>,
}

/// Field was in the payload, possibly as `null`
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl SessionPatch {
    pub fn from_row(row: &Value) -> Result<Self> {
        serde_json::from_value(row.clone())
            .map_err(|e| Error::Parse(format!("session patch: {}", e)))
    }

    pub fn status(id: SessionId, status: SessionStatus) -> Self {
        Self {
            id: Some(id),
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when the patch carries no field besides the id
    pub fn is_empty(&self) -> bool {
        self.owner_id.is_none()
            && self.title.is_none()
            && self.status.is_none()
            && self.updated_at.is_none()
            && self.duration_seconds.is_none()
            && self.template_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Created.can_transition_to(Recording));
        assert!(Recording.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Recording));
        assert!(!Processing.can_transition_to(Created));
        assert!(!Cancelled.can_transition_to(Processing));
    }

    #[test]
    fn test_row_with_artifacts() {
        let row = json!({
            "id": "6f1c1f38-8d4e-4b43-9a55-2f4c3a1d7e10",
            "user_id": "owner-1",
            "title": "Standup",
            "status": "completed",
            "created_at": "2026-01-05T10:00:00Z",
            "transcripts": [{"id": "t1", "content": "hello world"}],
            "summaries": [{"id": "s1"}]
        });
        let session = Session::from_row(&row).unwrap();
        assert_eq!(session.owner_id, "owner-1");
        assert_eq!(session.origin, RecordOrigin::Authoritative);
        assert!(session.artifacts.audio.is_empty());
        assert_eq!(
            session.content_signature(),
            ContentSignature {
                primary_id: Some("t1".to_string()),
                content_length: 11,
                count: 1,
            }
        );
    }

    #[test]
    fn test_patch_keeps_absent_fields_empty() {
        let patch = SessionPatch::from_row(&json!({"id": Uuid::nil(), "status": "processing"})).unwrap();
        assert_eq!(patch.status, Some(SessionStatus::Processing));
        assert!(patch.title.is_none());
        assert!(patch.duration_seconds.is_none());
        assert!(patch.template_id.is_none());
    }

    #[test]
    fn test_patch_null_is_a_clear() {
        let patch =
            SessionPatch::from_row(&json!({"id": Uuid::nil(), "template_id": null, "duration_seconds": 12.5}))
                .unwrap();
        assert_eq!(patch.template_id, Some(None));
        assert_eq!(patch.duration_seconds, Some(Some(12.5)));
        assert!(patch.updated_at.is_none());
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let err = Session::from_row(&json!({"id": Uuid::nil()})).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
