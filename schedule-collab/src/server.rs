//! WebSocket collaboration server.
//!
//! ```text
//!            handshake (?token= / Authorization: Bearer)
//! Client ──► ConnectionGate ──refused──► connect-error + close(1008)
//!               │
//!               ▼ admitted
//!            Session (Active) ◄──── text frames {"event", "payload"}
//!               │    ▲
//!               │    └── replies (room-members, update-accepted/-rejected, error)
//!               ▼
//!            CollabHub ── presence + rooms ── RoomBroadcaster
//!               │
//!               └──► outbound queue ──► select! loop ──► Client
//! ```
//!
//! One task per connection. Its `select!` loop multiplexes inbound frames
//! with the connection's outbound queue; when the loop ends for any reason
//! the session is disconnected and its departures are broadcast.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{outbound_channel, OutboundRx};
use crate::hub::CollabHub;
use crate::identity::{
    issue_token, AuthError, ConnectionGate, InMemoryUserDirectory, JwtIdentityProvider, UserDirectory,
};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::session::{Session, SessionError};
use crate::store::{MemoryStore, RocksStore, ScheduleStore, StoreConfig, StoreError};
use crate::update::UpdatePipeline;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// HS256 secret used to verify connection tokens
    pub jwt_secret: String,
    /// Outbound queue size per connection; overflowing frames are dropped
    pub outbound_capacity: usize,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Largest accepted inbound text frame
    pub max_message_bytes: usize,
    /// Usernames seeded into the in-memory directory, each with a logged token
    pub dev_users: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            jwt_secret: "dev-secret-key".to_string(),
            outbound_capacity: 256,
            storage_path: None,
            max_message_bytes: 64 * 1024,
            dev_users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Read `COLLAB_*` and `JWT_SECRET` from the environment (after loading
    /// `.env` if present). Missing or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = match non_empty("JWT_SECRET") {
            Some(secret) => secret,
            None => {
                log::warn!("JWT_SECRET not set; using the development secret");
                defaults.jwt_secret
            }
        };

        Self {
            bind_addr: non_empty("COLLAB_BIND_ADDR").unwrap_or(defaults.bind_addr),
            jwt_secret,
            outbound_capacity: parse_or(
                "COLLAB_OUTBOUND_CAPACITY",
                non_empty("COLLAB_OUTBOUND_CAPACITY"),
                defaults.outbound_capacity,
            ),
            storage_path: non_empty("COLLAB_STORAGE_PATH").map(PathBuf::from),
            max_message_bytes: parse_or(
                "COLLAB_MAX_MESSAGE_BYTES",
                non_empty("COLLAB_MAX_MESSAGE_BYTES"),
                defaults.max_message_bytes,
            ),
            dev_users: non_empty("COLLAB_DEV_USERS")
                .map(|names| {
                    names
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// A user created at startup for local testing.
#[derive(Debug, Clone)]
pub struct DevUser {
    pub username: String,
    pub user_id: Uuid,
    pub token: String,
}

/// Add each name as an active user and issue it a day-long token.
pub fn seed_dev_users(
    users: &InMemoryUserDirectory,
    names: &[String],
    jwt_secret: &str,
) -> Result<Vec<DevUser>, AuthError> {
    names
        .iter()
        .map(|name| {
            let user_id = users.add_active(name.as_str());
            let token = issue_token(jwt_secret, user_id, chrono::Duration::hours(24))?;
            log::info!("Dev user {name} ({user_id}) token: {token}");
            Ok(DevUser { username: name.clone(), user_id, token })
        })
        .collect()
}

fn parse_or(key: &str, raw: Option<String>, default: usize) -> usize {
    match raw.map(|v| v.trim().parse::<usize>()) {
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            log::warn!("Ignoring invalid {key}; using {default}");
            default
        }
        None => default,
    }
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_events: u64,
    pub committed_updates: u64,
    pub rejected_updates: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,
    total_events: AtomicU64,
    committed_updates: AtomicU64,
    rejected_updates: AtomicU64,
}

impl AtomicServerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reply(&self, reply: &ServerEvent) {
        match reply {
            ServerEvent::UpdateAccepted { .. } => Self::bump(&self.committed_updates),
            ServerEvent::UpdateRejected { .. } => Self::bump(&self.rejected_updates),
            _ => {}
        }
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            refused_connections: self.refused_connections.load(Ordering::Relaxed),
            total_events: self.total_events.load(Ordering::Relaxed),
            committed_updates: self.committed_updates.load(Ordering::Relaxed),
            rejected_updates: self.rejected_updates.load(Ordering::Relaxed),
        }
    }
}

/// Everything a connection task needs, cloned into each spawned task.
#[derive(Clone)]
struct ConnectionContext {
    hub: Arc<CollabHub>,
    gate: ConnectionGate,
    pipeline: UpdatePipeline,
    stats: Arc<AtomicServerStats>,
    outbound_capacity: usize,
    max_message_bytes: usize,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    gate: ConnectionGate,
    pipeline: UpdatePipeline,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Build a server over explicit store and user directory backends.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn ScheduleStore>,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        let provider = Arc::new(JwtIdentityProvider::new(&config.jwt_secret, users));
        Self {
            gate: ConnectionGate::new(provider),
            pipeline: UpdatePipeline::new(store),
            hub: Arc::new(CollabHub::new()),
            stats: Arc::new(AtomicServerStats::default()),
            config,
        }
    }

    /// Build a server from configuration alone: RocksDB when a storage path
    /// is set, otherwise an in-memory store whose user directory holds only
    /// the configured dev users.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        match config.storage_path.clone() {
            Some(path) => {
                if !config.dev_users.is_empty() {
                    log::warn!("COLLAB_DEV_USERS is ignored when a storage path is configured");
                }
                let rocks = Arc::new(RocksStore::open(StoreConfig {
                    path,
                    ..StoreConfig::default()
                })?);
                Ok(Self::new(config, rocks.clone(), rocks))
            }
            None => {
                log::warn!("No storage path configured; schedules and users live in memory only");
                let users = Arc::new(InMemoryUserDirectory::new());
                if config.dev_users.is_empty() {
                    log::warn!(
                        "User directory is empty; every connection will be refused. \
                         Set COLLAB_DEV_USERS or COLLAB_STORAGE_PATH"
                    );
                } else {
                    seed_dev_users(&users, &config.dev_users, &config.jwt_secret)?;
                }
                Ok(Self::new(config, Arc::new(MemoryStore::new()), users))
            }
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let ctx = ConnectionContext {
            hub: self.hub.clone(),
            gate: self.gate.clone(),
            pipeline: self.pipeline.clone(),
            stats: self.stats.clone(),
            outbound_capacity: self.config.outbound_capacity,
            max_message_bytes: self.config.max_message_bytes,
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), ServerError> {
        let mut token = None;
        let capture_token = |req: &Request, response: Response| {
            token = token_from_request(req);
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_token).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        AtomicServerStats::bump(&ctx.stats.total_connections);

        let mut session = Session::new(Uuid::new_v4(), ctx.hub.clone(), ctx.pipeline.clone());
        if let Err(e) = session.authenticate(&ctx.gate, token.as_deref()).await {
            AtomicServerStats::bump(&ctx.stats.refused_connections);
            let message = match e {
                SessionError::Refused(reason) => reason.to_string(),
                other => other.to_string(),
            };
            log::info!("Refusing {addr}: {message}");
            send_event(&mut ws_sender, &ServerEvent::ConnectError { message: message.clone() }).await?;
            ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: message.into(),
                })))
                .await?;
            return Ok(());
        }

        let (outbound, mut outbound_rx) = outbound_channel(ctx.outbound_capacity);
        let connected = session.activate(outbound)?;
        ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket session {} established from {addr}", session.conn_id());

        let result = Self::pump(
            &mut session,
            connected,
            &mut ws_sender,
            &mut ws_receiver,
            &mut outbound_rx,
            &ctx,
            addr,
        )
        .await;

        session.disconnect();
        ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn pump(
        session: &mut Session,
        connected: ServerEvent,
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        outbound_rx: &mut OutboundRx,
        ctx: &ConnectionContext,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        send_event(ws_sender, &connected).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            AtomicServerStats::bump(&ctx.stats.total_events);
                            let replies = Self::dispatch(session, text.as_str(), ctx.max_message_bytes).await;
                            for reply in replies {
                                ctx.stats.record_reply(&reply);
                                send_event(ws_sender, &reply).await?;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            let message = ProtocolError::BinaryFrame.to_string();
                            send_event(ws_sender, &ServerEvent::Error { message }).await?;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {}
                    }
                }

                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Decode one text frame and run it through the session. Anything that
    /// cannot be processed becomes an `error` reply; the connection stays up.
    async fn dispatch(session: &mut Session, text: &str, max_message_bytes: usize) -> Vec<ServerEvent> {
        if text.len() > max_message_bytes {
            let err = ProtocolError::TooLarge { size: text.len(), limit: max_message_bytes };
            log::warn!("Dropping event on {}: {err}", session.conn_id());
            return vec![ServerEvent::Error { message: err.to_string() }];
        }

        let event = match ClientEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping event on {}: {e}", session.conn_id());
                return vec![ServerEvent::Error { message: e.to_string() }];
            }
        };

        log::debug!("{} on {} for {}", event.name(), session.conn_id(), event.entity_id());
        match session.handle(event).await {
            Ok(replies) => replies,
            Err(e) => vec![ServerEvent::Error { message: e.to_string() }],
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub fn pipeline(&self) -> &UpdatePipeline {
        &self.pipeline
    }
}

async fn send_event(ws_sender: &mut WsSink, event: &ServerEvent) -> Result<(), ServerError> {
    ws_sender.send(Message::text(event.encode()?)).await?;
    Ok(())
}

/// The credential comes from the `token` query parameter, falling back to an
/// `Authorization: Bearer` header.
fn token_from_request(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|raw| match urlencoding::decode(raw) {
                Ok(token) => token.into_owned(),
                Err(_) => raw.to_owned(),
            })
    });

    from_query
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(|token| token.trim().to_owned())
        })
        .filter(|token| !token.is_empty())
}
