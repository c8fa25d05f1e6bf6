use std::hint::black_box;
use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};
use schedule_collab::broadcast::{outbound_channel, OutboundRx};
use schedule_collab::{
    AccountStatus, ClientEvent, CollabHub, Identity, MemoryStore, NewSchedule, PresenceRegistry,
    RocksStore, ScheduleChanges, ScheduleStore, ServerEvent, StoreConfig, UpdatePipeline,
};
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn draft() -> NewSchedule {
    let start = Utc::now();
    NewSchedule {
        title: "Bench".into(),
        description: None,
        start_time: start,
        end_time: start + chrono::Duration::hours(1),
        tags: Vec::new(),
        participants: Vec::new(),
    }
}

fn owner() -> Identity {
    Identity {
        user_id: Uuid::new_v4(),
        username: "bench".into(),
        status: AccountStatus::Active,
    }
}

fn bench_client_event_decode(c: &mut Criterion) {
    let frame = ClientEvent::UpdateEntity(schedule_collab::UpdateIntent {
        entity_id: Uuid::new_v4(),
        changes: ScheduleChanges {
            title: Some("Quarterly review".into()),
            description: Some("Bring numbers".into()),
            ..Default::default()
        },
        expected_version: Some(42),
    })
    .encode()
    .unwrap();

    c.bench_function("client_event_decode_update", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_server_event_encode(c: &mut Criterion) {
    let event = ServerEvent::Typing {
        entity_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        username: "alice".into(),
    };
    c.bench_function("server_event_encode_typing", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

/// One room of `members` single-device users, each with a drained queue.
fn populated_hub(members: usize) -> (CollabHub, Uuid, Vec<Uuid>, Vec<OutboundRx>) {
    let hub = CollabHub::new();
    let entity = Uuid::new_v4();
    let mut conns = Vec::with_capacity(members);
    let mut receivers = Vec::with_capacity(members);
    for _ in 0..members {
        let (user, conn) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, rx) = outbound_channel(4096);
        hub.register(user, conn, tx);
        hub.join(entity, user, conn);
        conns.push(conn);
        receivers.push(rx);
    }
    (hub, entity, conns, receivers)
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let (hub, entity, conns, mut receivers) = populated_hub(100);
    let event = ServerEvent::StopTyping { entity_id: entity, user_id: Uuid::new_v4() };

    c.bench_function("broadcast_to_100_members", |b| {
        b.iter(|| {
            black_box(hub.broadcast(entity, &event, Some(conns[0])));
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_presence_join_leave(c: &mut Criterion) {
    let mut registry = PresenceRegistry::new();
    let entities: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
    let users: Vec<(Uuid, Uuid)> = (0..64).map(|_| (Uuid::new_v4(), Uuid::new_v4())).collect();
    for (user, conn) in &users {
        registry.register_connection(*user, *conn);
    }

    c.bench_function("presence_join_leave_64x16", |b| {
        b.iter(|| {
            for entity in &entities {
                for (user, conn) in &users {
                    black_box(registry.join(*entity, *user, *conn));
                }
            }
            for entity in &entities {
                for (user, conn) in &users {
                    black_box(registry.leave(*entity, *user, *conn));
                }
            }
        })
    });
}

fn bench_update_pipeline_memory(c: &mut Criterion) {
    let rt = runtime();
    let store = Arc::new(MemoryStore::new());
    let actor = owner();
    let id = rt.block_on(store.create(draft(), actor.user_id)).unwrap().id;
    let pipeline = UpdatePipeline::new(store);
    let changes = ScheduleChanges { description: Some("bench".into()), ..Default::default() };

    c.bench_function("update_pipeline_memory_unconditional", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(pipeline.apply_update(&actor, id, &changes, None).await.unwrap())
        })
    });
}

fn bench_update_pipeline_rocks(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let actor = owner();
    let id = rt.block_on(store.create(draft(), actor.user_id)).unwrap().id;
    let pipeline = UpdatePipeline::new(store);
    let changes = ScheduleChanges { description: Some("bench".into()), ..Default::default() };

    c.bench_function("update_pipeline_rocks_unconditional", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(pipeline.apply_update(&actor, id, &changes, None).await.unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_client_event_decode,
    bench_server_event_encode,
    bench_broadcast_100_members,
    bench_presence_join_leave,
    bench_update_pipeline_memory,
    bench_update_pipeline_rocks,
);
criterion_main!(benches);
