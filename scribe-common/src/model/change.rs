//! Change-feed events delivered by the push channel

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::session::ArtifactKind;
use crate::{Error, Result};

/// Row operation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    #[serde(alias = "INSERT")]
    Insert,
    #[serde(alias = "UPDATE")]
    Update,
    #[serde(alias = "DELETE")]
    Delete,
}

/// What kind of entity the changed row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Artifact(ArtifactKind),
    Other,
}

impl EntityKind {
    pub fn from_table(table: &str) -> Self {
        if table == SESSIONS_TABLE {
            return EntityKind::Session;
        }
        ArtifactKind::from_table(table)
            .map(EntityKind::Artifact)
            .unwrap_or(EntityKind::Other)
    }
}

/// Table holding session rows
pub const SESSIONS_TABLE: &str = "sessions";

/// Envelope as it appears on the wire
#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(alias = "eventType", alias = "type")]
    operation: ChangeOperation,
    table: String,
    #[serde(default, alias = "old")]
    before: Option<Value>,
    #[serde(default, alias = "new", alias = "record")]
    after: Option<Value>,
}

/// One change-feed event
///
/// Ephemeral: consumed once by the reconciler, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub operation: ChangeOperation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub source_table: String,
}

impl ChangeEvent {
    pub fn new(
        operation: ChangeOperation,
        table: impl Into<String>,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Self {
        let source_table = table.into();
        Self {
            entity_kind: EntityKind::from_table(&source_table),
            operation,
            before: before.filter(|v| !is_empty_row(v)),
            after: after.filter(|v| !is_empty_row(v)),
            source_table,
        }
    }

    /// Parse a wire envelope `{operation, table, before?, after?}`
    pub fn parse(text: &str) -> Result<Self> {
        let wire: WireChange = serde_json::from_str(text)
            .map_err(|e| Error::Parse(format!("change event: {}", e)))?;
        Ok(Self::new(wire.operation, wire.table, wire.before, wire.after))
    }

    /// The row that describes the entity: `after` for inserts/updates,
    /// falling back to `before` (deletes only carry the old row)
    pub fn row(&self) -> Option<&Value> {
        match self.operation {
            ChangeOperation::Delete => self.before.as_ref().or(self.after.as_ref()),
            _ => self.after.as_ref().or(self.before.as_ref()),
        }
    }

    /// Primary key of the changed row, when it is a UUID
    pub fn row_id(&self) -> Option<Uuid> {
        self.row().and_then(|row| uuid_field(row, "id"))
    }

    /// Session this event is about: the row id for session rows, the
    /// `session_id` foreign key for artifact rows
    pub fn session_ref(&self) -> Option<Uuid> {
        match self.entity_kind {
            EntityKind::Session => self.row_id(),
            EntityKind::Artifact(_) => self.row().and_then(|row| uuid_field(row, "session_id")),
            EntityKind::Other => None,
        }
    }
}

fn uuid_field(row: &Value, field: &str) -> Option<Uuid> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

// Feeds send `{}` for the missing side of an insert/delete
fn is_empty_row(value: &Value) -> bool {
    value.is_null() || value.as_object().is_some_and(|o| o.is_empty())
}
