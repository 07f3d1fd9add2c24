//! Session control paths against in-memory Docker, wrapper, bus and API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use manman_bus::{DeliveryHandler, MemoryPublisher};
use manman_events::routing::{self, CommandKind};
use manman_events::{
    GameConfigSpec, HealthUpdate, KillSessionCommand, PortBinding, Protocol, SendInputCommand,
    ServerGameConfigSpec, StartSessionCommand, StopSessionCommand,
};
use manman_host_manager::blob::session_output_key;
use manman_host_manager::heartbeat;
use manman_host_manager::runtime::{ContainerSpec, RuntimeError};
use manman_host_manager::wrapper_client::WrapperCall;
use manman_host_manager::{
    BlobStore, Collaborators, CommandHandler, ContainerRuntime, FsBlobStore, LocalStatus,
    MockControlPlane, MockRuntime, MockWrapper, SessionManager, SessionRecord, SessionSettings,
    StateStore, WrapperApi,
};
use manman_id::{GameConfigId, ServerId, SessionId, SgcId};
use manman_params::ParamValues;
use manman_proto::wrapper::v1::StartRequest;
use tempfile::TempDir;

const SERVER: ServerId = ServerId::new(1);
const EXCHANGE: &str = "manman";

struct Harness {
    manager: Arc<SessionManager>,
    runtime: Arc<MockRuntime>,
    wrapper: Arc<MockWrapper>,
    publisher: Arc<MemoryPublisher>,
    control_plane: Arc<MockControlPlane>,
    state: Arc<StateStore>,
    blobs: Arc<FsBlobStore>,
    _dir: TempDir,
}

fn settings() -> SessionSettings {
    SessionSettings {
        wrapper_binary: "/usr/local/bin/manman-wrapper".into(),
        wrapper_port: 50051,
        stop_timeout: Duration::from_secs(5),
        starting_timeout: Duration::from_secs(120),
        wrapper_ready_timeout: Duration::from_secs(2),
        terminal_retention: Duration::from_secs(3600),
    }
}

fn harness_with(runtime: Arc<MockRuntime>, dir: TempDir) -> Harness {
    let wrapper = Arc::new(MockWrapper::new());
    let publisher = Arc::new(MemoryPublisher::new());
    let control_plane = Arc::new(MockControlPlane::new());
    let state = Arc::new(StateStore::load(dir.path().join("sessions.json")).unwrap());
    state.set_server_id(SERVER).unwrap();
    let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));

    let manager = Arc::new(SessionManager::new(
        SERVER,
        EXCHANGE,
        settings(),
        Collaborators {
            runtime: runtime.clone(),
            wrappers: wrapper.clone(),
            publisher: publisher.clone(),
            control_plane: control_plane.clone(),
            blobs: blobs.clone(),
            state: state.clone(),
        },
    ));

    Harness {
        manager,
        runtime,
        wrapper,
        publisher,
        control_plane,
        state,
        blobs,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(MockRuntime::new()), tempfile::tempdir().unwrap())
}

fn start_cmd(session: i64, sgc: i64, force: bool) -> StartSessionCommand {
    StartSessionCommand {
        session_id: SessionId::new(session),
        sgc_id: SgcId::new(sgc),
        game_config: GameConfigSpec {
            game_config_id: GameConfigId::new(1),
            game_id: None,
            name: "vanilla".to_string(),
            image: "itzg/minecraft-server:latest".to_string(),
            command: "/start".to_string(),
            args_template: vec!["--port".to_string(), "{{port}}".to_string()],
            env_template: BTreeMap::from([("EULA".to_string(), "TRUE".to_string())]),
            files: vec![],
            parameters: vec![],
            working_dir: None,
        },
        server_game_config: ServerGameConfigSpec {
            sgc_id: SgcId::new(sgc),
            server_id: SERVER,
            port_bindings: vec![PortBinding {
                container_port: 25565,
                host_port: 25565,
                protocol: Protocol::Tcp,
            }],
            parameters: ParamValues::from([("port".to_string(), "25565".to_string())]),
        },
        parameters: ParamValues::new(),
        force,
    }
}

fn stop_cmd(session: i64, force: bool) -> StopSessionCommand {
    StopSessionCommand {
        session_id: SessionId::new(session),
        force,
    }
}

/// Published `(status, exit_code)` pairs of one session, in order.
fn statuses(publisher: &MemoryPublisher, session: i64) -> Vec<(String, Option<i64>)> {
    let key = routing::session_status(SessionId::new(session));
    publisher
        .messages()
        .into_iter()
        .filter(|m| m.routing_key == key)
        .map(|m| {
            let json = m.json();
            (
                json["status"].as_str().unwrap().to_string(),
                json["exit_code"].as_i64(),
            )
        })
        .collect()
}

fn status_names(publisher: &MemoryPublisher, session: i64) -> Vec<String> {
    statuses(publisher, session).into_iter().map(|(s, _)| s).collect()
}

fn record(h: &Harness, session: i64) -> SessionRecord {
    h.state.get(SessionId::new(session)).unwrap().unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_start_then_stop_reports_full_lifecycle() {
    let h = harness();

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    assert_eq!(status_names(&h.publisher, 1), ["starting", "running"]);

    let running = record(&h, 1);
    assert_eq!(running.status, LocalStatus::Running);
    let container = running.container_id.clone().unwrap();
    assert!(h.runtime.is_running(&container));
    assert_eq!(h.runtime.networks(), ["manman-session-1"]);

    let address = running.wrapper_address.clone().unwrap();
    assert!(address.ends_with(":50051"));
    assert_eq!(
        h.wrapper.calls()[0],
        WrapperCall::Start {
            address: address.clone(),
            command: "/start".to_string(),
            args: vec!["--port".to_string(), "25565".to_string()],
        }
    );

    h.manager.stop(stop_cmd(1, false)).await.unwrap();
    assert_eq!(
        statuses(&h.publisher, 1),
        [
            ("starting".to_string(), None),
            ("running".to_string(), None),
            ("stopping".to_string(), None),
            ("stopped".to_string(), Some(0)),
        ]
    );
    assert!(h.wrapper.calls().contains(&WrapperCall::Stop {
        address,
        graceful: true,
    }));
    assert!(h.runtime.container_ids().is_empty());
    assert!(h.runtime.networks().is_empty());
    assert_eq!(record(&h, 1).status, LocalStatus::Stopped);
}

#[tokio::test]
async fn test_redelivered_commands_are_idempotent() {
    let h = harness();

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();

    let starts = h
        .wrapper
        .calls()
        .into_iter()
        .filter(|c| matches!(c, WrapperCall::Start { .. }))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(h.runtime.container_ids().len(), 1);
    assert_eq!(status_names(&h.publisher, 1), ["starting", "running", "running"]);

    h.manager.stop(stop_cmd(1, false)).await.unwrap();
    h.manager.stop(stop_cmd(1, false)).await.unwrap();
    assert_eq!(
        status_names(&h.publisher, 1),
        ["starting", "running", "running", "stopping", "stopped", "stopped"]
    );
}

#[tokio::test]
async fn test_force_start_replaces_session_of_same_sgc() {
    let h = harness();

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    let first_container = record(&h, 1).container_id.unwrap();

    h.manager.start(start_cmd(2, 1, true)).await.unwrap();

    assert_eq!(
        statuses(&h.publisher, 1),
        [
            ("starting".to_string(), None),
            ("running".to_string(), None),
            ("stopping".to_string(), None),
            ("stopped".to_string(), Some(137)),
        ]
    );
    assert_eq!(status_names(&h.publisher, 2), ["starting", "running"]);
    assert!(!h.runtime.container_ids().contains(&first_container));
    assert_eq!(record(&h, 2).status, LocalStatus::Running);
}

#[tokio::test]
async fn test_start_without_force_rejects_busy_sgc() {
    let h = harness();

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    let err = h.manager.start(start_cmd(2, 1, false)).await.unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(status_names(&h.publisher, 2), ["starting", "crashed"]);
    assert_eq!(record(&h, 1).status, LocalStatus::Running);

    // A different SGC is unaffected.
    h.manager.start(start_cmd(3, 2, false)).await.unwrap();
    assert_eq!(status_names(&h.publisher, 3), ["starting", "running"]);
}

#[tokio::test]
async fn test_bad_image_crashes_session() {
    let h = harness();
    h.runtime
        .fail_creates_with(Some(RuntimeError::Permanent("404: no such image".to_string())));

    let err = h.manager.start(start_cmd(1, 1, false)).await.unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(status_names(&h.publisher, 1), ["starting", "crashed"]);
    assert_eq!(record(&h, 1).status, LocalStatus::Crashed);
    assert!(h.runtime.networks().is_empty());
}

#[tokio::test]
async fn test_transient_failure_allows_retry() {
    let h = harness();
    h.runtime
        .fail_creates_with(Some(RuntimeError::Transient("daemon restarting".to_string())));

    let err = h.manager.start(start_cmd(1, 1, false)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.state.get(SessionId::new(1)).unwrap().is_none());

    h.runtime.fail_creates_with(None);
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();

    assert_eq!(status_names(&h.publisher, 1), ["starting", "starting", "running"]);
}

#[tokio::test]
async fn test_start_redelivered_after_starting_publish_failed_launches() {
    let h = harness();
    h.publisher.set_failing(true);

    let err = h.manager.start(start_cmd(1, 1, false)).await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.runtime.container_ids().is_empty());

    h.publisher.set_failing(false);
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();

    assert_eq!(record(&h, 1).status, LocalStatus::Running);
    assert_eq!(h.runtime.container_ids().len(), 1);
    assert!(h
        .wrapper
        .calls()
        .iter()
        .any(|c| matches!(c, WrapperCall::Start { .. })));
    assert_eq!(status_names(&h.publisher, 1), ["starting", "running"]);
}

#[tokio::test]
async fn test_monitor_attached_when_running_publish_fails() {
    let h = harness();
    h.publisher.fail_after(1);

    let err = h.manager.start(start_cmd(1, 1, false)).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(record(&h, 1).status, LocalStatus::Running);

    h.publisher.set_failing(false);
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    assert_eq!(status_names(&h.publisher, 1), ["starting", "running"]);

    let address = record(&h, 1).wrapper_address.unwrap();
    wait_for(|| h.wrapper.has_subscriber(&address)).await;
    h.wrapper.exit(&address, 3);

    wait_for(|| status_names(&h.publisher, 1).contains(&"crashed".to_string())).await;
    assert_eq!(record(&h, 1).status, LocalStatus::Crashed);
    assert!(h.runtime.container_ids().is_empty());
}

#[tokio::test]
async fn test_wrapper_is_dialed_until_ready() {
    let h = harness();
    h.wrapper.fail_next_starts(3);

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    assert_eq!(record(&h, 1).status, LocalStatus::Running);
}

#[tokio::test]
async fn test_unexpected_exit_is_reported_as_crash_and_output_archived() {
    let h = harness();

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    let address = record(&h, 1).wrapper_address.unwrap();

    wait_for(|| h.wrapper.has_subscriber(&address)).await;
    h.wrapper.emit(&address, b"[Server] Done (4.1s)!\n");
    h.wrapper.exit(&address, 1);

    wait_for(|| status_names(&h.publisher, 1).contains(&"crashed".to_string())).await;

    assert_eq!(
        statuses(&h.publisher, 1).last().unwrap(),
        &("crashed".to_string(), Some(1))
    );
    assert_eq!(record(&h, 1).status, LocalStatus::Crashed);
    assert!(h.runtime.container_ids().is_empty());

    let key = session_output_key(SessionId::new(1));
    assert_eq!(h.blobs.download(&key).await.unwrap(), b"[Server] Done (4.1s)!\n");
    let refs = h.control_plane.log_references();
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].blob_key, key);
    assert_eq!(refs[0].size_bytes, 22);
}

#[tokio::test]
async fn test_kill_starting_and_unknown_sessions() {
    let h = harness();

    let err = h
        .manager
        .kill(KillSessionCommand {
            session_id: SessionId::new(9),
        })
        .await
        .unwrap_err();
    assert!(!err.is_transient());

    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    h.manager
        .kill(KillSessionCommand {
            session_id: SessionId::new(1),
        })
        .await
        .unwrap();
    assert_eq!(
        status_names(&h.publisher, 1),
        ["starting", "running", "stopping", "stopped"]
    );
    assert!(h.runtime.container_ids().is_empty());
}

#[tokio::test]
async fn test_send_input_requires_running_session() {
    let h = harness();
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();

    h.manager
        .send_input(SendInputCommand {
            session_id: SessionId::new(1),
            input: "say hello\n".to_string(),
        })
        .await
        .unwrap();
    assert!(h.wrapper.calls().iter().any(|c| matches!(
        c,
        WrapperCall::SendInput { data, .. } if data == b"say hello\n"
    )));

    h.manager.stop(stop_cmd(1, false)).await.unwrap();
    let err = h
        .manager
        .send_input(SendInputCommand {
            session_id: SessionId::new(1),
            input: "say bye\n".to_string(),
        })
        .await
        .unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_recovery_adopts_running_and_marks_missing_lost() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(MockRuntime::new());

    let spec = |session: i64| ContainerSpec {
        name: format!("manman-session-{session}"),
        image: "itzg/minecraft-server".to_string(),
        network: format!("manman-session-{session}"),
        entrypoint: vec![],
        env: vec![],
        binds: vec![],
        ports: vec![],
        labels: ContainerSpec::session_labels(SERVER, SessionId::new(session), SgcId::new(session)),
    };
    // Session 1: recorded and still running. Session 3: unknown orphan whose game died.
    runtime.insert_container("c1", spec(1), true);
    runtime.insert_container("c3", spec(3), true);
    // Another server's container is never touched.
    let mut foreign = spec(4);
    foreign.labels = ContainerSpec::session_labels(ServerId::new(2), SessionId::new(4), SgcId::new(4));
    runtime.insert_container("c4", foreign, true);

    let h = harness_with(runtime, dir);

    let c1_ip = h
        .runtime
        .inspect_container("c1")
        .await
        .unwrap()
        .unwrap()
        .ip_address
        .unwrap();
    h.wrapper
        .start(&format!("http://{c1_ip}:50051"), StartRequest::default())
        .await
        .unwrap();

    let mut running = SessionRecord::new(SessionId::new(1), SgcId::new(1), LocalStatus::Running);
    running.container_id = Some("c1".to_string());
    h.state.upsert(running).unwrap();
    // Session 2: recorded but its container vanished.
    h.state
        .upsert(SessionRecord::new(SessionId::new(2), SgcId::new(2), LocalStatus::Running))
        .unwrap();

    let report = h.manager.recover().await.unwrap();

    assert_eq!(report.resumed, [SessionId::new(1)]);
    assert_eq!(report.lost, [SessionId::new(2)]);
    assert_eq!(report.crashed, [SessionId::new(3)]);

    assert_eq!(record(&h, 1).status, LocalStatus::Running);
    assert_eq!(record(&h, 2).status, LocalStatus::Lost);
    assert_eq!(record(&h, 3).status, LocalStatus::Crashed);

    assert_eq!(status_names(&h.publisher, 1), ["running"]);
    assert_eq!(status_names(&h.publisher, 2), ["crashed"]);
    assert_eq!(status_names(&h.publisher, 3), ["crashed"]);

    let mut left: Vec<String> = h.runtime.container_ids();
    left.sort();
    assert_eq!(left, ["c1", "c4"]);
}

#[tokio::test]
async fn test_heartbeat_reports_session_counts() {
    let h = harness();
    h.manager.start(start_cmd(1, 1, false)).await.unwrap();
    h.manager.start(start_cmd(2, 2, false)).await.unwrap();
    h.manager.stop(stop_cmd(2, false)).await.unwrap();

    let update = heartbeat::beat(&h.manager, h.publisher.as_ref(), EXCHANGE)
        .await
        .unwrap();
    let stats = update.session_stats.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.stopped, 1);
    assert_eq!(stats.stuck_starting, 0);

    let published: Vec<_> = h
        .publisher
        .messages()
        .into_iter()
        .filter(|m| m.routing_key == routing::health(SERVER))
        .collect();
    assert_eq!(published.len(), 1);
    let parsed: HealthUpdate = serde_json::from_slice(&published[0].body).unwrap();
    assert_eq!(parsed.server_id, SERVER);
}

#[tokio::test]
async fn test_command_handler_dispatches_by_routing_key() {
    let h = harness();
    let handler = CommandHandler::new(Arc::clone(&h.manager));

    let start_key = routing::command(SERVER, CommandKind::Start);
    let body = serde_json::to_vec(&start_cmd(1, 1, false)).unwrap();
    handler.handle(&start_key, &body).await.unwrap();
    assert_eq!(record(&h, 1).status, LocalStatus::Running);

    let stop_key = routing::command(SERVER, CommandKind::Stop);
    let body = serde_json::to_vec(&stop_cmd(1, false)).unwrap();
    handler.handle(&stop_key, &body).await.unwrap();
    assert_eq!(record(&h, 1).status, LocalStatus::Stopped);

    let err = handler.handle(&start_key, b"{not json").await.unwrap_err();
    assert!(err.is_permanent());

    let err = handler
        .handle("cmd.host.1.session.reboot", b"{}")
        .await
        .unwrap_err();
    assert!(err.is_permanent());
}
