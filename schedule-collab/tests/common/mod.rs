//! Shared harness: a real server on an ephemeral port with in-memory
//! backends the test can seed directly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schedule_collab::{
    issue_token, ClientError, CollabClient, CollabServer, InMemoryUserDirectory, MemoryStore,
    NewSchedule, Participant, Permission, ScheduleStore, ServerConfig, ServerEvent,
};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const SECRET: &str = "integration-secret";
pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(200);

pub struct TestServer {
    pub url: String,
    pub server: Arc<CollabServer>,
    pub users: Arc<InMemoryUserDirectory>,
    pub store: Arc<MemoryStore>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let users = Arc::new(InMemoryUserDirectory::new());
        let store = Arc::new(MemoryStore::new());
        let config = ServerConfig {
            bind_addr: addr.to_string(),
            jwt_secret: SECRET.to_string(),
            ..config
        };
        let server = Arc::new(CollabServer::new(config, store.clone(), users.clone()));

        let serving = server.clone();
        tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });

        Self {
            url: format!("ws://{addr}"),
            server,
            users,
            store,
        }
    }

    pub fn token(&self, user_id: Uuid) -> String {
        issue_token(SECRET, user_id, chrono::Duration::hours(1)).unwrap()
    }

    pub async fn connect(&self, user_id: Uuid) -> CollabClient {
        CollabClient::connect(&self.url, &self.token(user_id)).await.unwrap()
    }

    pub async fn try_connect(&self, token: &str) -> Result<CollabClient, ClientError> {
        CollabClient::connect(&self.url, token).await
    }

    /// A one-hour schedule owned by `owner`, editable by `editors`.
    pub async fn schedule(&self, owner: Uuid, editors: &[Uuid]) -> Uuid {
        let start = Utc::now();
        let draft = NewSchedule {
            title: "Team planning".into(),
            description: Some("Sprint kickoff".into()),
            start_time: start,
            end_time: start + chrono::Duration::hours(1),
            tags: vec!["team".into()],
            participants: editors
                .iter()
                .map(|user_id| Participant { user_id: *user_id, permission: Permission::Editor })
                .collect(),
        };
        self.store.create(draft, owner).await.unwrap().id
    }
}

pub async fn expect_event(client: &mut CollabClient) -> ServerEvent {
    client.next_event_within(WAIT).await.unwrap()
}

/// Nothing arrives within `QUIET`.
pub async fn expect_silence(client: &mut CollabClient) {
    match client.next_event_within(QUIET).await {
        Err(ClientError::Timeout) => {}
        other => panic!("Expected no event, got {other:?}"),
    }
}

/// Poll `condition` until it holds or `WAIT` elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
