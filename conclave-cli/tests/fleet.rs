//! End-to-end tests running real `conclave-node` processes under the supervisor

use conclave_core::config::{NodeConfig, SupervisorConfig};
use conclave_core::control::{ControlCommand, ControlResponse};
use conclave_core::events::EventType;
use conclave_core::metrics::{MetricsFormat, NodeMetrics, labels, series_key};
use conclave_supervisor::{Edge, NodeStatus, NodeSupervisor};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

async fn fleet(dir: &TempDir, nodes: &[(&str, u16)]) -> NodeSupervisor {
    let settings = SupervisorConfig {
        node_command: PathBuf::from(env!("CARGO_BIN_EXE_conclave-node")),
        socket_dir: dir.path().to_path_buf(),
        spawn_stagger: Duration::from_millis(50),
        ready_timeout: Duration::from_secs(10),
        stop_timeout: Duration::from_secs(5),
        terminate_grace: Duration::from_secs(2),
        socket_timeout: Duration::from_secs(2),
        ..SupervisorConfig::default()
    };
    let supervisor = NodeSupervisor::new(settings).await.unwrap();
    for (name, port) in nodes {
        supervisor
            .add_node(NodeConfig::new(*name, *port))
            .await
            .unwrap();
    }
    supervisor.start_all(true).await.unwrap();
    supervisor
}

#[tokio::test]
async fn test_fleet_health_and_shutdown() {
    let dir = TempDir::new().unwrap();
    let supervisor = fleet(&dir, &[("alpha", 8001), ("beta", 8002)]).await;

    for name in ["alpha", "beta"] {
        supervisor.client().health_check(name).await.unwrap();
        assert!(supervisor.client().socket_path(name).exists());
    }

    supervisor.stop_all().await;
    for name in ["alpha", "beta"] {
        let info = supervisor.node_status(name).await.unwrap();
        assert_eq!(info.status, NodeStatus::Stopped);
        // Graceful shutdown removes the socket
        assert!(!supervisor.client().socket_path(name).exists());
    }
}

#[tokio::test]
async fn test_fleet_connect_records_edges() {
    let dir = TempDir::new().unwrap();
    let supervisor = fleet(&dir, &[("alpha", 8001), ("beta", 8002)]).await;

    supervisor.connect("alpha", "beta", true).await.unwrap();
    assert_eq!(
        supervisor.connections().await,
        vec![Edge::new("alpha", "beta"), Edge::new("beta", "alpha")]
    );

    let metrics = supervisor
        .client()
        .metrics("alpha", MetricsFormat::Json)
        .await
        .unwrap();
    let connections = series_key(
        NodeMetrics::CONNECTIONS,
        &labels([("node", "alpha"), ("peer", "beta")]),
    );
    assert_eq!(metrics["counters"][connections.as_str()]["value"], 1.0);
    let active = series_key(NodeMetrics::CONNECTIONS_ACTIVE, &labels([("node", "alpha")]));
    assert_eq!(metrics["gauges"][active.as_str()]["value"], 1.0);

    let text = supervisor
        .client()
        .metrics("beta", MetricsFormat::Prometheus)
        .await
        .unwrap();
    let text = text.as_str().unwrap();
    assert!(text.contains("# TYPE node_up gauge"));
    assert!(text.contains("node_up{node=\"beta\"} 1"));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_fleet_rejects_bogus_command() {
    let dir = TempDir::new().unwrap();
    let supervisor = fleet(&dir, &[("alpha", 8001)]).await;

    let socket = supervisor.client().socket_path("alpha");
    let reply = {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        stream.write_all(b"{\"cmd\": \"bogus\"}\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        ControlResponse::parse(&line).unwrap()
    };
    assert_eq!(reply, ControlResponse::error("Unknown command: bogus"));

    // The node keeps serving
    let response = supervisor
        .client()
        .send_command("alpha", &ControlCommand::Health)
        .await
        .unwrap();
    assert!(!response.is_error());

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_fleet_event_stream() {
    let dir = TempDir::new().unwrap();
    let supervisor = fleet(&dir, &[("alpha", 8001), ("beta", 8002)]).await;

    let mut events = supervisor.client().subscribe_events("alpha").await.unwrap();
    supervisor.connect("alpha", "beta", false).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next_event())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.node, "alpha");
        seen.push(event.event_type);
    }
    assert_eq!(seen, vec![EventType::ControlCommand, EventType::PeerConnected]);

    drop(events);
    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_fleet_recovers_killed_node() {
    let dir = TempDir::new().unwrap();
    let supervisor = fleet(&dir, &[("alpha", 8001)]).await;
    let pid = supervisor.node_status("alpha").await.unwrap().pid.unwrap();

    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        supervisor.check_crashes(3).await;
        let info = supervisor.node_status("alpha").await.unwrap();
        if info.restart_count == 1 && info.status == NodeStatus::Running {
            assert_ne!(info.pid, Some(pid));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "node was not restarted");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    supervisor
        .wait_for_ready(Duration::from_secs(10))
        .await
        .unwrap();
    supervisor.client().health_check("alpha").await.unwrap();

    supervisor.stop_all().await;
}
