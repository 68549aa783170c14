//! Session endpoints: bulk fetch and the writes behind local operations

use async_trait::async_trait;
use reqwest::Method;
use scribe_common::model::{Session, SessionId};
use serde_json::{json, Value};
use tracing::warn;

use crate::transport::{CallOptions, RequestBody, Transport, TransportError};

#[async_trait]
pub trait SessionSource: Send + Sync {
    /// All sessions of `owner_id`, newest first
    ///
    /// Individually malformed rows are skipped; a body that is not a list
    /// is a `Decode` error.
    async fn fetch_sessions(&self, owner_id: &str) -> Result<Vec<Session>, TransportError>;

    /// Persist a locally created session, returning the stored row
    async fn create_session(&self, session: &Session) -> Result<Session, TransportError>;

    async fn delete_session(&self, id: SessionId) -> Result<(), TransportError>;

    /// Partial update of stored fields
    async fn update_session(&self, id: SessionId, fields: Value) -> Result<(), TransportError>;
}

/// `SessionSource` over the HTTP transport
#[derive(Clone)]
pub struct HttpSessionSource {
    transport: Transport,
}

impl HttpSessionSource {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

/// Decode rows one by one, dropping the ones that do not parse
pub fn decode_rows(rows: Vec<Value>) -> Vec<Session> {
    rows.into_iter()
        .filter_map(|row| match Session::from_row(&row) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Skipping malformed session row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_sessions(&self, owner_id: &str) -> Result<Vec<Session>, TransportError> {
        let rows: Vec<Value> = self
            .transport
            .get_json(
                &format!("/sessions?owner_id={}", owner_id),
                CallOptions::default(),
            )
            .await?;
        Ok(decode_rows(rows))
    }

    async fn create_session(&self, session: &Session) -> Result<Session, TransportError> {
        let body = json!({
            "id": session.id,
            "owner_id": session.owner_id,
            "title": session.title,
            "status": session.status,
            "created_at": session.created_at,
            "template_id": session.template_id,
        });
        let row: Value = self
            .transport
            .send_json(Method::POST, "/sessions", &body, CallOptions::default())
            .await?;
        Session::from_row(&row).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn delete_session(&self, id: SessionId) -> Result<(), TransportError> {
        self.transport
            .call(
                Method::DELETE,
                &format!("/sessions/{}", id),
                None,
                CallOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn update_session(&self, id: SessionId, fields: Value) -> Result<(), TransportError> {
        self.transport
            .call(
                Method::PATCH,
                &format!("/sessions/{}", id),
                Some(RequestBody::Json(fields)),
                CallOptions::default(),
            )
            .await?;
        Ok(())
    }
}
