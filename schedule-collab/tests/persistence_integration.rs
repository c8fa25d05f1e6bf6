//! Persistence integration tests.
//!
//! Verifies:
//! - Commits made over the wire land in RocksDB with their versions
//! - Users stored in RocksDB gate admission
//! - Committed versions survive closing and reopening the store
//! - Conflicts are decided against the persisted version

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use schedule_collab::{
    issue_token, AccountStatus, ClientError, CollabClient, CollabServer, Identity, NewSchedule,
    Participant, Permission, RejectReason, RocksStore, ScheduleChanges, ScheduleStore,
    ServerConfig, ServerEvent, StoreConfig, UpdateError, UpdatePipeline, UserRecord,
};
use tempfile::tempdir;
use tokio::net::TcpListener;
use uuid::Uuid;

const SECRET: &str = "persistence-secret";

fn user(name: &str, status: AccountStatus) -> UserRecord {
    UserRecord { user_id: Uuid::new_v4(), username: name.into(), status }
}

fn draft(editors: &[Uuid]) -> NewSchedule {
    let start = Utc::now();
    NewSchedule {
        title: "Board meeting".into(),
        description: None,
        start_time: start,
        end_time: start + chrono::Duration::hours(2),
        tags: Vec::new(),
        participants: editors
            .iter()
            .map(|user_id| Participant { user_id: *user_id, permission: Permission::Editor })
            .collect(),
    }
}

async fn start_server(store: Arc<RocksStore>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        jwt_secret: SECRET.to_string(),
        ..ServerConfig::default()
    };
    let server = CollabServer::new(config, store.clone(), store);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    format!("ws://{addr}")
}

async fn next(client: &mut CollabClient) -> ServerEvent {
    client.next_event_within(Duration::from_secs(2)).await.unwrap()
}

#[tokio::test]
async fn test_commits_over_the_wire_are_persisted() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let owner = user("owner", AccountStatus::Active);
    let editor = user("editor", AccountStatus::Active);
    store.put_user(&owner).unwrap();
    store.put_user(&editor).unwrap();
    let id = store.create(draft(&[editor.user_id]), owner.user_id).await.unwrap().id;

    let url = start_server(store.clone()).await;
    let token = |u: &UserRecord| issue_token(SECRET, u.user_id, chrono::Duration::hours(1)).unwrap();
    let mut a = CollabClient::connect(&url, &token(&owner)).await.unwrap();
    let mut b = CollabClient::connect(&url, &token(&editor)).await.unwrap();

    for v in 0..5u64 {
        let changes = ScheduleChanges { description: Some(format!("rev {v}")), ..Default::default() };
        a.update(id, changes, Some(v)).await.unwrap();
        assert!(matches!(next(&mut a).await, ServerEvent::UpdateAccepted { version, .. } if version == v + 1));
    }

    b.update(id, ScheduleChanges { title: Some("late".into()), ..Default::default() }, Some(3))
        .await
        .unwrap();
    match next(&mut b).await {
        ServerEvent::UpdateRejected { reason, current_version, .. } => {
            assert_eq!(reason, RejectReason::Conflict);
            assert_eq!(current_version, Some(5));
        }
        other => panic!("Expected update-rejected, got {other:?}"),
    }

    let stored = store.read(id).await.unwrap();
    assert_eq!(stored.version, 5);
    assert_eq!(stored.description.as_deref(), Some("rev 4"));
    assert_eq!(stored.title, "Board meeting");
}

#[tokio::test]
async fn test_rocks_user_directory_gates_admission() {
    let dir = tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let active = user("active", AccountStatus::Active);
    let disabled = user("disabled", AccountStatus::Disabled);
    store.put_user(&active).unwrap();
    store.put_user(&disabled).unwrap();

    let url = start_server(store).await;
    let token = |u: &UserRecord| issue_token(SECRET, u.user_id, chrono::Duration::hours(1)).unwrap();

    let client = CollabClient::connect(&url, &token(&active)).await.unwrap();
    assert_eq!(client.username(), "active");
    assert!(matches!(
        CollabClient::connect(&url, &token(&disabled)).await,
        Err(ClientError::Refused(_))
    ));
}

#[tokio::test]
async fn test_versions_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let owner = Identity {
        user_id: Uuid::new_v4(),
        username: "owner".into(),
        status: AccountStatus::Active,
    };

    let id = {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        let id = store.create(draft(&[]), owner.user_id).await.unwrap().id;
        let pipeline = UpdatePipeline::new(store.clone());
        for v in 0..3 {
            let changes = ScheduleChanges { title: Some(format!("take {v}")), ..Default::default() };
            pipeline.apply_update(&owner, id, &changes, Some(v)).await.unwrap();
        }
        store.sync().unwrap();
        id
    };

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
    let recovered = store.read(id).await.unwrap();
    assert_eq!(recovered.version, 3);
    assert_eq!(recovered.title, "take 2");
    assert_eq!(store.list_schedules().unwrap(), vec![id]);

    // A writer still holding a pre-restart version loses.
    let pipeline = UpdatePipeline::new(store);
    let stale = ScheduleChanges { title: Some("stale".into()), ..Default::default() };
    assert_eq!(
        pipeline.apply_update(&owner, id, &stale, Some(2)).await,
        Err(UpdateError::Conflict { current_version: 3 })
    );
    let fresh = pipeline.apply_update(&owner, id, &stale, Some(3)).await.unwrap();
    assert_eq!(fresh.version, 4);
}
