//! Server-sent-events change feed
//!
//! Consumes `GET /realtime/{channel}` as a `text/event-stream`. Each `data:`
//! frame carries one change envelope `{operation, table, before?, after?}`.
//! The HTTP handshake completing with 2xx is the subscription acknowledgement.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use scribe_common::model::{ChangeEvent, ChannelState};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feed::{ChangeFeed, FeedMessage, SubscriptionRequest};
use super::ChannelError;
use crate::transport::{CallOptions, Transport, TransportError};

const FEED_BUFFER: usize = 64;

/// `ChangeFeed` over SSE
pub struct SseChangeFeed {
    transport: Transport,
    handshake_timeout: Duration,
    streams: Mutex<HashMap<String, CancellationToken>>,
}

impl SseChangeFeed {
    pub fn new(transport: Transport, handshake_timeout: Duration) -> Self {
        Self {
            transport,
            handshake_timeout,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// `{base}/realtime/{name}?owner=..&table=..`, every part encoded
    fn endpoint(&self, request: &SubscriptionRequest) -> Result<String, ChannelError> {
        let invalid = |message: String| ChannelError::Subscribe {
            name: request.name.clone(),
            message,
        };
        let mut url = Url::parse(self.transport.base_url()).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid(format!("cannot-be-a-base URL {}", self.transport.base_url())))?
            .pop_if_empty()
            .push("realtime")
            .push(&request.name);
        url.query_pairs_mut()
            .append_pair("owner", &request.owner_key)
            .append_pair("table", &request.table);
        Ok(url.into())
    }
}

#[async_trait]
impl ChangeFeed for SseChangeFeed {
    async fn subscribe(
        &self,
        request: &SubscriptionRequest,
    ) -> Result<mpsc::Receiver<FeedMessage>, ChannelError> {
        let path = self.endpoint(request)?;
        let cancel = CancellationToken::new();
        if let Ok(mut streams) = self.streams.lock() {
            if let Some(previous) = streams.insert(request.name.clone(), cancel.clone()) {
                previous.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let transport = self.transport.clone();
        let name = request.name.clone();
        let options = CallOptions::default()
            .with_timeout(self.handshake_timeout)
            .with_cancel(&cancel);

        tokio::spawn(async move {
            let response = match transport.open_event_stream(&path, options).await {
                Ok(response) => response,
                Err(TransportError::Cancelled) => return,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Event stream handshake failed");
                    let state = match e {
                        TransportError::Timeout { .. } => ChannelState::TimedOut,
                        _ => ChannelState::Error,
                    };
                    let _ = tx.send(FeedMessage::State(state)).await;
                    return;
                }
            };

            info!(channel = %name, "Event stream open");
            if tx
                .send(FeedMessage::State(ChannelState::Subscribed))
                .await
                .is_err()
            {
                return;
            }

            let mut body = response.bytes_stream();
            let mut parser = SseParser::default();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for frame in parser.push(&bytes) {
                            match ChangeEvent::parse(&frame.data) {
                                Ok(event) => {
                                    if tx.send(FeedMessage::Event(event)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!(channel = %name, error = %e, "Skipping undecodable frame")
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(channel = %name, error = %e, "Event stream failed");
                        let _ = tx.send(FeedMessage::State(ChannelState::Error)).await;
                        return;
                    }
                    None => {
                        info!(channel = %name, "Event stream ended");
                        let _ = tx.send(FeedMessage::State(ChannelState::Closed)).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, name: &str) -> Result<(), ChannelError> {
        let token = self
            .streams
            .lock()
            .map_err(|_| ChannelError::Unsubscribe {
                name: name.to_string(),
                message: "stream table poisoned".to_string(),
            })?
            .remove(name);
        match token {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ChannelError::NotTracked(name.to_string())),
        }
    }
}

/// One dispatched SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => self.data.push(value.to_string()),
                "event" => self.event = Some(value.to_string()),
                _ => {}
            }
        }

        frames
    }
}
