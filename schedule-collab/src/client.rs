//! WebSocket client for the collaboration server.
//!
//! Used by the integration tests and benchmarks, and usable by any Rust
//! consumer. `connect` completes only after the server's first frame:
//! `connected` yields a client, `connect-error` yields
//! `ClientError::Refused`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ClientEvent, EntityRef, ProtocolError, ServerEvent, UpdateIntent};
use crate::store::ScheduleChanges;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: &'static str },
    #[error("Timed out waiting for a server event")]
    Timeout,
    #[error("Connection closed")]
    Closed,
}

pub struct CollabClient {
    user_id: Uuid,
    username: String,
    connection_id: Uuid,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::Receiver<ServerEvent>,
    state: Arc<RwLock<ConnectionState>>,
}

impl CollabClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:9090`) presenting `token`.
    pub async fn connect(server_url: &str, token: &str) -> Result<Self, ClientError> {
        let url = format!("{}/?token={token}", server_url.trim_end_matches('/'));
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(1024);
        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *reader_state.write() = ConnectionState::Disconnected;
        });

        match event_rx.recv().await {
            Some(ServerEvent::Connected {
                user_id,
                username,
                connection_id,
            }) => {
                *state.write() = ConnectionState::Connected;
                Ok(Self {
                    user_id,
                    username,
                    connection_id,
                    outgoing: out_tx,
                    events: event_rx,
                    state,
                })
            }
            Some(ServerEvent::ConnectError { message }) => Err(ClientError::Refused(message)),
            Some(other) => Err(ClientError::Unexpected {
                expected: "connected",
                got: other.name(),
            }),
            None => Err(ClientError::Closed),
        }
    }

    pub async fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        self.send_raw(event.encode()?).await
    }

    /// Send a text frame as-is, bypassing event encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::text(text.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn join(&self, entity_id: Uuid) -> Result<(), ClientError> {
        self.send(&ClientEvent::JoinEntity(EntityRef { entity_id })).await
    }

    pub async fn leave(&self, entity_id: Uuid) -> Result<(), ClientError> {
        self.send(&ClientEvent::LeaveEntity(EntityRef { entity_id })).await
    }

    pub async fn update(
        &self,
        entity_id: Uuid,
        changes: ScheduleChanges,
        expected_version: Option<u64>,
    ) -> Result<(), ClientError> {
        self.send(&ClientEvent::UpdateEntity(UpdateIntent {
            entity_id,
            changes,
            expected_version,
        }))
        .await
    }

    pub async fn typing(&self, entity_id: Uuid, started: bool) -> Result<(), ClientError> {
        let target = EntityRef { entity_id };
        let event = if started {
            ClientEvent::TypingStart(target)
        } else {
            ClientEvent::TypingStop(target)
        };
        self.send(&event).await
    }

    /// Next event from the server, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub async fn next_event_within(&mut self, limit: Duration) -> Result<ServerEvent, ClientError> {
        match tokio::time::timeout(limit, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }

    /// Send a close frame. The server cleans up once it sees it.
    pub async fn close(self) -> Result<(), ClientError> {
        self.outgoing
            .send(Message::Close(None))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}
