//! Connection manager lifecycle against the scriptable mock provider.

use meshscope::broadcast::{EventBroadcaster, Subscription};
use meshscope::connection::{ConnectError, ConnectionManager, ManagerTuning};
use meshscope::model::{ConnectionState, ConnectionStatus, LogLevel, LogMessage, NodeRef};
use meshscope::transport::mock::MockProvider;
use meshscope::transport::{ConnectParams, TransportEvent, TransportKind, TransportTarget};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next<T>(sub: &mut Subscription<T>) -> T {
    timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

/// Skip log events until one matches.
async fn log_matching(
    logs: &mut Subscription<LogMessage>,
    level: LogLevel,
    needle: &str,
) -> LogMessage {
    loop {
        let message = next(logs).await;
        if message.level == level && message.message.contains(needle) {
            return message;
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn manager(mock: &MockProvider) -> (ConnectionManager, EventBroadcaster) {
    let events = EventBroadcaster::new();
    let manager = ConnectionManager::new(Arc::new(mock.clone()), events.clone());
    (manager, events)
}

#[tokio::test]
async fn network_session_end_to_end() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut nodes = events.node_discovered().subscribe();
    let mut packets = events.packet_received().subscribe();

    manager
        .connect("network", &ConnectParams::network("10.0.0.5"))
        .expect("connect accepted");
    assert_eq!(next(&mut status).await, ConnectionStatus::up("Connected"));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        mock.opened_targets(),
        vec![TransportTarget::Network { host: "10.0.0.5".into() }]
    );
    assert_eq!(manager.target().map(|t| t.kind()), Some(TransportKind::Network));

    assert!(mock.node_updated("!a1b2c3d4", json!({"user": {"shortName": "ABCD"}})));
    let node = next(&mut nodes).await;
    assert_eq!(node.id, "!a1b2c3d4");
    assert_eq!(node.short_name, "ABCD");
    assert_eq!(node.long_name, "Unknown Node !a1b2c3d4");
    assert!(node.position.is_none());

    assert!(mock.packet(json!({"from": 123, "decoded": {"portnum": "TEXT_MESSAGE_APP"}})));
    let packet = next(&mut packets).await;
    assert_eq!(packet.from_node, NodeRef::Num(123));
    assert_eq!(packet.to_node, NodeRef::Unknown);
    assert_eq!(packet.port_number, "TEXT_MESSAGE_APP");

    manager.disconnect().await;
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Disconnected"));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn initial_node_table_is_enumerated_on_connect() {
    let mock = MockProvider::new();
    mock.upsert_node("!00000001", json!({"user": {"longName": "Base"}}));
    mock.upsert_node("!00000002", json!({}));
    let (mut manager, events) = manager(&mock);
    let mut nodes = events.node_discovered().subscribe();

    manager.connect("serial", &ConnectParams::serial("/dev/ttyUSB0")).unwrap();
    let first = next(&mut nodes).await;
    let second = next(&mut nodes).await;
    assert_eq!(first.long_name, "Base");
    assert_eq!(second.short_name, "Node-0002");

    manager.disconnect().await;
}

#[tokio::test]
async fn serial_without_port_fails_without_opening() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut nodes = events.node_discovered().subscribe();
    let mut logs = events.log_message().subscribe();

    let err = manager
        .connect("serial", &ConnectParams::default())
        .unwrap_err();
    assert_eq!(
        err,
        ConnectError::MissingParameter { kind: TransportKind::Serial, parameter: "port" }
    );

    let reason = "serial transport requires a port".to_string();
    assert_eq!(next(&mut status).await, ConnectionStatus::down(reason.clone()));
    assert_eq!(manager.state(), ConnectionState::Failed(reason));
    log_matching(&mut logs, LogLevel::Error, "Connection error").await;

    settle().await;
    assert!(status.try_recv().is_none());
    assert!(nodes.try_recv().is_none());
    assert!(mock.opened_targets().is_empty());
}

#[tokio::test]
async fn unreachable_serial_port_fails_quietly() {
    let mock = MockProvider::new();
    mock.fail_next_open("No such file or directory");
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut nodes = events.node_discovered().subscribe();
    let mut packets = events.packet_received().subscribe();

    manager.connect("serial", &ConnectParams::serial("/dev/does-not-exist")).unwrap();
    let down = next(&mut status).await;
    assert!(!down.connected);
    assert!(down.reason.contains("No such file or directory"));
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));

    assert!(!mock.packet(json!({"id": 1})));
    settle().await;
    assert!(nodes.try_recv().is_none());
    assert!(packets.try_recv().is_none());
    assert!(status.try_recv().is_none());
}

#[tokio::test]
async fn unsupported_kind_is_rejected() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();

    let err = manager.connect("lora", &ConnectParams::network("h")).unwrap_err();
    assert!(matches!(err, ConnectError::UnsupportedKind(ref k) if k == "lora"));
    assert!(!next(&mut status).await.connected);
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn open_failure_reports_reason_and_allows_retry() {
    let mock = MockProvider::new();
    mock.fail_next_open("no radio");
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();

    manager.connect("tcp", &ConnectParams::network("10.0.0.5")).unwrap();
    let down = next(&mut status).await;
    assert!(!down.connected);
    assert_eq!(down.reason, "failed to open network on 10.0.0.5: no radio");
    assert_eq!(manager.state(), ConnectionState::Failed(down.reason.clone()));

    // Failed -> Connecting -> Connected
    manager.connect("tcp", &ConnectParams::network("10.0.0.5")).unwrap();
    assert_eq!(next(&mut status).await, ConnectionStatus::up("Connected"));
    manager.disconnect().await;
}

#[tokio::test]
async fn connect_while_connected_is_ignored() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut logs = events.log_message().subscribe();

    manager.connect("ble", &ConnectParams::ble("AA:BB:CC:DD:EE:FF")).unwrap();
    assert!(next(&mut status).await.connected);

    manager.connect("network", &ConnectParams::network("10.0.0.5")).unwrap();
    log_matching(&mut logs, LogLevel::Warn, "Connect request ignored").await;
    assert_eq!(mock.opened_targets().len(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_idempotent_and_silences_the_stream() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut packets = events.packet_received().subscribe();

    // Nothing to do while idle.
    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Idle);
    assert!(status.try_recv().is_none());

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert!(next(&mut status).await.connected);
    manager.disconnect().await;
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Disconnected"));

    manager.disconnect().await;
    assert!(!mock.packet(json!({"id": 1})));
    settle().await;
    assert!(status.try_recv().is_none());
    assert!(packets.try_recv().is_none());
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn disconnect_during_slow_open_is_bounded() {
    let mock = MockProvider::new();
    mock.set_open_delay(Duration::from_secs(30));
    let events = EventBroadcaster::new();
    let mut manager = ConnectionManager::new(Arc::new(mock.clone()), events.clone())
        .with_tuning(ManagerTuning { shutdown_timeout: Duration::from_millis(100) });
    let mut status = events.connection_status().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert_eq!(manager.state(), ConnectionState::Connecting);

    timeout(Duration::from_secs(1), manager.disconnect())
        .await
        .expect("disconnect must not wait for the open");
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Disconnected"));
    assert!(!mock.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_racing_open_never_leaks_the_handle() {
    for round in 0..600u64 {
        let mock = MockProvider::new();
        mock.set_open_delay(Duration::from_millis(2));
        let (mut manager, _events) = manager(&mock);

        manager.connect("network", &ConnectParams::network("h")).unwrap();
        tokio::time::sleep(Duration::from_micros(1_500 + (round % 20) * 100)).await;
        manager.disconnect().await;

        assert!(!mock.is_open(), "round {}: handle left open", round);
        assert_eq!(
            mock.close_count(),
            mock.opened_targets().len(),
            "round {}: opened handle never closed",
            round
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}

#[tokio::test]
async fn connection_lost_keeps_state_and_established_reports_up() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert!(next(&mut status).await.connected);

    assert!(mock.emit(TransportEvent::ConnectionLost));
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Connection lost"));
    assert_eq!(manager.state(), ConnectionState::Connected);

    assert!(mock.emit(TransportEvent::ConnectionEstablished));
    assert_eq!(
        next(&mut status).await,
        ConnectionStatus::up("Connection established")
    );

    manager.disconnect().await;
}

#[tokio::test]
async fn stream_end_disconnects() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert!(next(&mut status).await.connected);

    mock.drop_stream();
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Transport closed"));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(mock.close_count(), 1);

    // Worker already finished; nothing further is published.
    manager.disconnect().await;
    settle().await;
    assert!(status.try_recv().is_none());
}

#[tokio::test]
async fn handler_panic_does_not_stop_the_worker() {
    let mock = MockProvider::new();
    mock.panic_on_node_table(true);
    let (mut manager, events) = manager(&mock);
    let mut logs = events.log_message().subscribe();
    let mut nodes = events.node_discovered().subscribe();
    let mut packets = events.packet_received().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    log_matching(&mut logs, LogLevel::Error, "panicked").await;

    assert!(mock.emit(TransportEvent::NodeUpdated));
    log_matching(&mut logs, LogLevel::Error, "node-updated panicked").await;

    mock.panic_on_node_table(false);
    assert!(mock.packet(json!({"id": 5, "from": 1})));
    assert_eq!(next(&mut packets).await.id, 5);
    assert!(mock.node_updated("!0000abcd", json!({})));
    assert_eq!(next(&mut nodes).await.id, "!0000abcd");
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect().await;
}

#[tokio::test]
async fn node_table_error_is_logged() {
    let mock = MockProvider::new();
    mock.fail_node_table(Some("table unavailable".into()));
    let (mut manager, events) = manager(&mock);
    let mut logs = events.log_message().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    let message = log_matching(&mut logs, LogLevel::Error, "Error discovering nodes").await;
    assert!(message.message.contains("table unavailable"));
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.disconnect().await;
}

#[tokio::test]
async fn malformed_fields_are_defaulted_and_logged() {
    let mock = MockProvider::new();
    let (mut manager, events) = manager(&mock);
    let mut logs = events.log_message().subscribe();
    let mut nodes = events.node_discovered().subscribe();
    let mut status = events.connection_status().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert!(next(&mut status).await.connected);

    assert!(mock.node_updated(
        "!a1b2c3d4",
        json!({"snr": "loud", "user": {"shortName": "ABCD"}})
    ));
    let node = next(&mut nodes).await;
    assert_eq!(node.short_name, "ABCD");
    assert!(node.snr.is_none());
    log_matching(&mut logs, LogLevel::Error, "snr").await;

    manager.disconnect().await;
}

#[tokio::test]
async fn close_error_is_swallowed() {
    let mock = MockProvider::new();
    mock.fail_close("device busy");
    let (mut manager, events) = manager(&mock);
    let mut status = events.connection_status().subscribe();
    let mut logs = events.log_message().subscribe();

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert!(next(&mut status).await.connected);

    manager.disconnect().await;
    let warning = log_matching(&mut logs, LogLevel::Warn, "Error closing transport").await;
    assert!(warning.message.contains("device busy"));
    assert_eq!(next(&mut status).await, ConnectionStatus::down("Disconnected"));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test]
fn connect_outside_a_runtime_fails_cleanly() {
    let mock = MockProvider::new();
    let events = EventBroadcaster::new();
    let mut status = events.connection_status().subscribe();
    let mut manager = ConnectionManager::new(Arc::new(mock.clone()), events.clone());

    let err = manager
        .connect("network", &ConnectParams::network("h"))
        .unwrap_err();
    assert_eq!(err, ConnectError::NoRuntime);
    assert!(matches!(manager.state(), ConnectionState::Failed(_)));
    let down = status.try_recv().expect("failure status published");
    assert!(!down.connected);
    assert!(mock.opened_targets().is_empty());
}

#[test]
fn connect_from_a_plain_thread_uses_the_supplied_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mock = MockProvider::new();
    let events = EventBroadcaster::new();
    let mut status = events.connection_status().subscribe();
    let mut manager = ConnectionManager::new(Arc::new(mock.clone()), events.clone())
        .with_runtime(runtime.handle().clone());

    manager.connect("network", &ConnectParams::network("h")).unwrap();
    assert_eq!(
        runtime.block_on(next(&mut status)),
        ConnectionStatus::up("Connected")
    );
    runtime.block_on(manager.disconnect());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(mock.close_count(), 1);
}
