//! Handler and sweep behaviour against the in-memory store and publisher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manman_bus::{DeliveryHandler, MemoryPublisher};
use manman_events::routing;
use manman_events::{
    HealthUpdate, HostStatusUpdate, ServerStatus, SessionStats, SessionStatus,
    SessionStatusUpdate,
};
use manman_id::{ServerId, SessionId, SgcId};
use manman_processor::{
    ExternalPublisher, HandlerRegistry, MemoryStore, StaleSweeper, SweepConfig,
};

const EXTERNAL: &str = "manman.external";

struct Harness {
    registry: HandlerRegistry,
    store: Arc<MemoryStore>,
    publisher: Arc<MemoryPublisher>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let registry = HandlerRegistry::new(
        store.clone(),
        ExternalPublisher::new(publisher.clone(), EXTERNAL),
    );
    Harness {
        registry,
        store,
        publisher,
    }
}

fn session_update(id: i64, status: SessionStatus, exit_code: Option<i32>) -> (String, Vec<u8>) {
    let update = SessionStatusUpdate {
        session_id: SessionId::new(id),
        sgc_id: SgcId::new(1),
        status,
        exit_code,
    };
    (
        routing::session_status(update.session_id),
        serde_json::to_vec(&update).unwrap(),
    )
}

async fn deliver_session(
    h: &Harness,
    id: i64,
    status: SessionStatus,
    exit_code: Option<i32>,
) -> Result<(), manman_bus::HandlerError> {
    let (key, body) = session_update(id, status, exit_code);
    h.registry.handle(&key, &body).await
}

#[tokio::test]
async fn test_start_stop_lifecycle_is_persisted_and_republished() {
    let h = harness();
    let id = SessionId::new(1);
    h.store.insert_session(id, SgcId::new(1), SessionStatus::Pending);

    deliver_session(&h, 1, SessionStatus::Starting, None).await.unwrap();
    deliver_session(&h, 1, SessionStatus::Running, None).await.unwrap();

    let running = h.store.session(id).unwrap();
    assert_eq!(running.status, SessionStatus::Running);
    let started_at = running.started_at.expect("started_at recorded");

    deliver_session(&h, 1, SessionStatus::Stopping, None).await.unwrap();
    deliver_session(&h, 1, SessionStatus::Stopped, Some(0)).await.unwrap();

    let stopped = h.store.session(id).unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert_eq!(stopped.exit_code, Some(0));
    assert_eq!(stopped.started_at, Some(started_at));
    assert!(stopped.ended_at.is_some());

    assert_eq!(
        h.publisher.routing_keys(),
        [
            "manman.session.starting",
            "manman.session.running",
            "manman.session.stopping",
            "manman.session.stopped",
        ]
    );
    let last = h.publisher.on_exchange(EXTERNAL).pop().unwrap().json();
    assert_eq!(last["exit_code"], 0);
    assert!(last.get("parameters").is_none());
}

#[tokio::test]
async fn test_invalid_transition_is_permanent_and_leaves_state() {
    let h = harness();
    let id = SessionId::new(1);
    h.store.insert_session(id, SgcId::new(1), SessionStatus::Stopped);
    let before = h.store.session(id).unwrap();

    let err = deliver_session(&h, 1, SessionStatus::Running, None)
        .await
        .unwrap_err();

    assert!(err.is_permanent());
    assert_eq!(h.store.session(id).unwrap(), before);
    assert!(h.publisher.messages().is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_is_a_noop() {
    let h = harness();
    let id = SessionId::new(1);
    h.store.insert_session(id, SgcId::new(1), SessionStatus::Starting);

    deliver_session(&h, 1, SessionStatus::Crashed, Some(1)).await.unwrap();
    let after_first = h.store.session(id).unwrap();

    deliver_session(&h, 1, SessionStatus::Crashed, Some(1)).await.unwrap();

    assert_eq!(h.store.session(id).unwrap(), after_first);
    assert_eq!(h.publisher.routing_keys(), ["manman.session.crashed"]);
}

#[tokio::test]
async fn test_unknown_session_and_malformed_body_are_permanent() {
    let h = harness();

    let err = deliver_session(&h, 99, SessionStatus::Starting, None)
        .await
        .unwrap_err();
    assert!(err.is_permanent());

    let err = h
        .registry
        .handle("status.session.1", b"{\"session_id\":")
        .await
        .unwrap_err();
    assert!(err.is_permanent());

    let err = h.registry.handle("status.node.1", b"{}").await.unwrap_err();
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_database_outage_is_transient() {
    let h = harness();
    h.store
        .insert_session(SessionId::new(1), SgcId::new(1), SessionStatus::Pending);
    h.store.set_unavailable(true);

    let err = deliver_session(&h, 1, SessionStatus::Starting, None)
        .await
        .unwrap_err();
    assert!(!err.is_permanent());

    h.store.set_unavailable(false);
    deliver_session(&h, 1, SessionStatus::Starting, None).await.unwrap();
}

#[tokio::test]
async fn test_external_publish_failure_does_not_fail_handler() {
    let h = harness();
    let id = SessionId::new(1);
    h.store.insert_session(id, SgcId::new(1), SessionStatus::Starting);
    h.publisher.set_failing(true);

    deliver_session(&h, 1, SessionStatus::Running, None).await.unwrap();

    assert_eq!(h.store.session(id).unwrap().status, SessionStatus::Running);
    assert!(h.publisher.messages().is_empty());
}

#[tokio::test]
async fn test_host_status_changes_are_republished_once() {
    let h = harness();
    let id = ServerId::new(3);
    h.store.insert_server(id, "node-a-prod", ServerStatus::Offline, None);

    let body = serde_json::to_vec(&HostStatusUpdate {
        server_id: id,
        status: ServerStatus::Online,
    })
    .unwrap();
    let key = routing::host_status(id);
    h.registry.handle(&key, &body).await.unwrap();
    h.registry.handle(&key, &body).await.unwrap();

    let server = h.store.server(id).unwrap();
    assert_eq!(server.status, ServerStatus::Online);
    assert!(server.last_seen.is_some());
    assert_eq!(h.publisher.routing_keys(), ["manman.host.online"]);

    let err = h
        .registry
        .handle(
            &routing::host_status(ServerId::new(4)),
            &serde_json::to_vec(&HostStatusUpdate {
                server_id: ServerId::new(4),
                status: ServerStatus::Online,
            })
            .unwrap(),
        )
        .await
        .unwrap_err();
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_heartbeat_brings_offline_host_back() {
    let h = harness();
    let id = ServerId::new(3);
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    h.store
        .insert_server(id, "node-a-prod", ServerStatus::Offline, Some(long_ago));

    let body = serde_json::to_vec(&HealthUpdate {
        server_id: id,
        session_stats: Some(SessionStats {
            total: 1,
            starting: 1,
            stuck_starting: 1,
            ..Default::default()
        }),
    })
    .unwrap();
    h.registry.handle(&routing::health(id), &body).await.unwrap();
    h.registry.handle(&routing::health(id), &body).await.unwrap();

    let server = h.store.server(id).unwrap();
    assert_eq!(server.status, ServerStatus::Online);
    assert!(server.last_seen.unwrap() > long_ago);
    assert_eq!(h.publisher.routing_keys(), ["manman.host.online"]);
}

#[tokio::test]
async fn test_sweep_marks_only_stale_servers() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let sweeper = StaleSweeper::new(
        store.clone(),
        ExternalPublisher::new(publisher.clone(), EXTERNAL),
        SweepConfig {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(10),
        },
    );

    let now = Utc::now();
    store.insert_server(
        ServerId::new(1),
        "stale",
        ServerStatus::Online,
        Some(now - chrono::Duration::seconds(60)),
    );
    store.insert_server(ServerId::new(2), "fresh", ServerStatus::Online, Some(now));
    store.insert_server(
        ServerId::new(3),
        "already-offline",
        ServerStatus::Offline,
        Some(now - chrono::Duration::hours(1)),
    );

    let marked = sweeper.sweep_once().await.unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0].id, ServerId::new(1));

    assert_eq!(store.server(ServerId::new(1)).unwrap().status, ServerStatus::Offline);
    assert_eq!(store.server(ServerId::new(2)).unwrap().status, ServerStatus::Online);
    assert_eq!(store.server(ServerId::new(2)).unwrap().last_seen, Some(now));

    let stale_events = publisher.on_exchange(EXTERNAL);
    assert_eq!(stale_events.len(), 1);
    assert_eq!(stale_events[0].routing_key, "manman.host.stale");
    assert_eq!(stale_events[0].json()["server_id"], 1);

    // A second pass finds nothing new.
    assert!(sweeper.sweep_once().await.unwrap().is_empty());
    assert_eq!(publisher.messages().len(), 1);
}

#[tokio::test]
async fn test_sweep_survives_publish_failure() {
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(MemoryPublisher::new());
    publisher.set_failing(true);
    let sweeper = StaleSweeper::new(
        store.clone(),
        ExternalPublisher::new(publisher.clone(), EXTERNAL),
        SweepConfig::default(),
    );
    store.insert_server(ServerId::new(1), "stale", ServerStatus::Online, None);

    let marked = sweeper.sweep_once().await.unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(store.server(ServerId::new(1)).unwrap().status, ServerStatus::Offline);
}
