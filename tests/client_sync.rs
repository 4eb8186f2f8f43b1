use std::{collections::VecDeque, time::Duration};

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use stocksync::{
    change::{ChangeKind, ChangeRecord},
    client::{
        replica::ReplicaError,
        scheduler::{ClientConfig, CycleOutcome, SyncClient, SyncError, SyncState},
        transport::{PullTransport, TransportError},
    },
    core::{mutation::Mutation, store::EntityStore},
    entity::StorageDraft,
    persist::sqlite::SqliteReplicaSink,
    runtime::handle::{ServerConfig, ServerHandle, spawn_server},
    sync::endpoint::PullResponse,
    types::{ActorId, Revision, Table},
};

fn create(name: &str) -> Mutation {
    Mutation::CreateStorage(StorageDraft {
        name: name.to_string(),
        description: None,
    })
}

fn quiet_config() -> ClientConfig {
    ClientConfig::default().with_sync_interval_ms(60_000)
}

struct SlowTransport {
    server: ServerHandle,
    delay: Duration,
}

impl PullTransport for SlowTransport {
    async fn pull(&self, watermark: Option<Revision>) -> Result<PullResponse, TransportError> {
        tokio::time::sleep(self.delay).await;
        PullTransport::pull(&self.server, watermark).await
    }
}

struct ScriptedTransport {
    responses: parking_lot::Mutex<VecDeque<PullResponse>>,
}

impl PullTransport for ScriptedTransport {
    async fn pull(&self, _watermark: Option<Revision>) -> Result<PullResponse, TransportError> {
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Unavailable("script exhausted".to_string()))
    }
}

fn bogus_update() -> ChangeRecord {
    let payload = match json!({"name": "ghost"}) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    };
    ChangeRecord {
        id: Uuid::new_v4(),
        revision: 1,
        actor: ActorId::new("admin"),
        table: Table::Storages,
        key: "ghost".to_string(),
        kind: ChangeKind::Update,
        payload: Some(payload),
        ts_ms: 0,
    }
}

#[tokio::test]
async fn connect_sync_and_disconnect() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    let s1 = server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1").key;

    let client = SyncClient::new(server.clone(), quiet_config());
    assert_eq!(client.state(), SyncState::Disconnected);
    assert!(matches!(client.sync_now().await, Err(SyncError::NotConnected)));

    let first = client.connect().await.expect("connect");
    assert_eq!(first, CycleOutcome::Applied { changes: 2, watermark: 1 });
    assert_eq!(client.state(), SyncState::Connected);
    assert!(client.read(|r| r.get(Table::Storages, &s1).is_some()));

    server.mutate(ActorId::new("admin"), create("S2")).await.expect("s2");
    let second = client.sync_now().await.expect("sync");
    assert_eq!(second, CycleOutcome::Applied { changes: 2, watermark: 2 });
    assert_eq!(client.read(|r| r.rows(Table::Storages).len()), 2);

    client.disconnect();
    assert_eq!(client.state(), SyncState::Disconnected);
    assert!(matches!(client.sync_now().await, Err(SyncError::NotConnected)));
    assert_eq!(client.watermark(), Some(2));

    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn scheduler_pulls_on_its_interval() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    let client = SyncClient::new(
        server.clone(),
        ClientConfig::default().with_sync_interval_ms(20),
    );
    client.connect().await.expect("connect");
    assert_eq!(client.watermark(), Some(0));

    server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1");

    let caught_up = tokio::time::timeout(Duration::from_secs(2), async {
        while client.watermark() != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(caught_up.is_ok(), "scheduler never pulled");

    client.disconnect();
    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn local_changes_block_connect_until_reset() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1");

    let client = SyncClient::new(server.clone(), quiet_config());
    client.write_local(|r| r.put_local(Table::Storages, "local-only", serde_json::Map::new()));

    let err = client.connect().await.expect_err("dirty replica");
    assert!(matches!(err, SyncError::Consistency(ReplicaError::LocalChanges(1))));
    assert!(!err.is_transient());
    assert_eq!(client.state(), SyncState::Error { will_retry: false });

    let outcome = client.reset().await.expect("reset");
    assert_eq!(outcome, CycleOutcome::Applied { changes: 2, watermark: 1 });
    assert!(client.read(|r| r.get(Table::Storages, "local-only").is_none()));
    assert!(!client.read(|r| r.has_local_changes()));
    assert_eq!(client.state(), SyncState::Connected);

    client.disconnect();
    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn consistency_error_wipes_replica_and_keeps_retrying() {
    let mut store = EntityStore::new();
    store.apply(&ActorId::new("admin"), &create("S1")).expect("s1");
    let valid = stocksync::sync::endpoint::pull(store.changelog(), None);

    let transport = ScriptedTransport {
        responses: parking_lot::Mutex::new(VecDeque::from([
            PullResponse {
                changes: vec![bogus_update()],
                new_watermark: 1,
            },
            valid,
        ])),
    };
    let client = SyncClient::new(transport, quiet_config());

    let err = client.connect().await.expect_err("diverged");
    assert!(matches!(
        err,
        SyncError::Consistency(ReplicaError::MissingRow { kind: ChangeKind::Update, .. })
    ));
    assert_eq!(client.state(), SyncState::Error { will_retry: true });
    assert_eq!(client.watermark(), None);
    assert!(client.read(|r| r.is_empty()));

    let recovered = client.sync_now().await.expect("resync");
    assert_eq!(recovered, CycleOutcome::Applied { changes: 2, watermark: 1 });
    assert_eq!(client.state(), SyncState::Connected);

    let exhausted = client.sync_now().await.expect_err("no more responses");
    assert!(exhausted.is_transient());
    assert_eq!(client.watermark(), Some(1));
    client.disconnect();
}

#[tokio::test]
async fn overlapping_pull_is_skipped() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    let transport = SlowTransport {
        server: server.clone(),
        delay: Duration::from_millis(100),
    };
    let client = SyncClient::new(transport, quiet_config());
    client.connect().await.expect("connect");

    let (a, b) = tokio::join!(client.sync_now(), client.sync_now());
    assert!(matches!(a, Ok(CycleOutcome::Applied { .. })));
    assert_eq!(b.expect("skipped"), CycleOutcome::Skipped);

    client.disconnect();
    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn disconnect_lets_in_flight_pull_finish() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    let transport = SlowTransport {
        server: server.clone(),
        delay: Duration::from_millis(100),
    };
    let client = SyncClient::new(transport, quiet_config());
    client.connect().await.expect("connect");
    server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1");

    let (res, ()) = tokio::join!(client.sync_now(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.disconnect();
    });
    assert_eq!(res.expect("sync"), CycleOutcome::Applied { changes: 2, watermark: 1 });
    assert_eq!(client.watermark(), Some(1));
    assert_eq!(client.state(), SyncState::Disconnected);

    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn slow_pull_times_out_without_touching_replica() {
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1");
    let transport = SlowTransport {
        server: server.clone(),
        delay: Duration::from_millis(300),
    };
    let client = SyncClient::new(transport, quiet_config().with_pull_timeout_ms(30));

    let err = client.connect().await.expect_err("timeout");
    assert!(matches!(err, SyncError::Transport(TransportError::Timeout)));
    assert!(err.is_transient());
    assert_eq!(client.state(), SyncState::Error { will_retry: true });
    assert_eq!(client.watermark(), None);

    client.disconnect();
    server.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn replica_survives_restart_through_sqlite() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("replica.db");
    let server = spawn_server(EntityStore::new(), None, ServerConfig::default());
    server.mutate(ActorId::new("admin"), create("S1")).await.expect("s1");

    let sink = SqliteReplicaSink::open(&db_path).expect("open");
    let replica = sink.load_replica().expect("load");
    let client = SyncClient::with_replica(server.clone(), quiet_config(), replica, Some(Box::new(sink)));
    client.connect().await.expect("connect");
    client.disconnect();
    let synced = client.read(|r| r.clone());
    drop(client);

    let reopened = SqliteReplicaSink::open(&db_path).expect("reopen");
    let restored = reopened.load_replica().expect("load");
    assert_eq!(restored, synced);

    server.mutate(ActorId::new("admin"), create("S2")).await.expect("s2");
    let client = SyncClient::with_replica(server.clone(), quiet_config(), restored, Some(Box::new(reopened)));
    let outcome = client.connect().await.expect("resume");
    assert_eq!(outcome, CycleOutcome::Applied { changes: 2, watermark: 2 });
    assert_eq!(client.read(|r| r.rows(Table::Storages).len()), 2);

    client.disconnect();
    server.shutdown().await.expect("shutdown");
}

#[test]
fn client_config_reads_partial_json() {
    let cfg = ClientConfig::from_json_str(r#"{"sync_interval_ms": 500}"#).expect("parse");
    assert_eq!(cfg.sync_interval_ms, 500);
    assert_eq!(cfg.pull_timeout_ms, 10_000);
    assert!(cfg.wipe_on_consistency_error);
}
