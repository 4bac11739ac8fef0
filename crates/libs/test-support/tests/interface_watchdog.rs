mod common;

use std::sync::Arc;
use std::time::Duration;

use lxnode_core::node::Node;
use lxnode_core::transport::{MeshTransport, RouterFactory};
use lxnode_core::NodeError;
use test_support::{InterfaceAction, MemoryRouterFactory, MemoryTransport, DEFAULT_IFACE};

#[tokio::test(start_paused = true)]
async fn sustained_outage_triggers_halt_settle_resume() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Watchdog").await;

    // never online: first reset once the outage passes the threshold
    tokio::time::sleep(Duration::from_secs(10)).await;
    let calls = test_node.transport.interface_calls();
    let halt = calls
        .iter()
        .find(|call| call.action == InterfaceAction::Halt)
        .expect("halt recorded");
    assert_eq!(halt.name, DEFAULT_IFACE);
    let resume = calls
        .iter()
        .find(|call| call.action == InterfaceAction::Resume)
        .expect("resume recorded");
    assert_eq!(resume.name, DEFAULT_IFACE);
    assert!(
        resume.at.saturating_duration_since(halt.at) >= Duration::from_millis(400),
        "sockets get a settle interval between halt and resume"
    );
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn resets_back_off_for_twelve_seconds() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Backoff").await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let halts: Vec<_> = test_node
        .transport
        .interface_calls()
        .into_iter()
        .filter(|call| call.action == InterfaceAction::Halt)
        .collect();
    assert!(halts.len() >= 2, "outage persists, so the watchdog retries");
    assert!(
        halts[1].at.saturating_duration_since(halts[0].at) >= Duration::from_secs(12),
        "second reset respects the backoff"
    );
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn online_interface_keeps_the_watchdog_quiet() {
    let transport = MemoryTransport::new();
    transport.set_interface(DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Quiet").await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(test_node.transport.interface_calls().is_empty());
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn disabling_an_interface_rewrites_config_and_halts() {
    let transport = MemoryTransport::new();
    transport.set_interface(DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Toggle").await;

    test_node.node.set_interface_enabled(DEFAULT_IFACE, false).expect("disable");
    let config = std::fs::read_to_string(test_node.dir.path().join("rns").join("config"))
        .expect("read config");
    assert!(config.contains("interface_enabled = No"), "config: {config}");
    let calls = test_node.transport.interface_calls();
    assert!(calls
        .iter()
        .any(|call| call.action == InterfaceAction::Halt && call.name == DEFAULT_IFACE));

    test_node.node.set_interface_enabled(DEFAULT_IFACE, true).expect("enable");
    let config = std::fs::read_to_string(test_node.dir.path().join("rns").join("config"))
        .expect("read config");
    assert!(config.contains("interface_enabled = Yes"), "config: {config}");
    // AutoInterface comes back via resume, not reload
    let calls = test_node.transport.interface_calls();
    assert!(calls
        .iter()
        .any(|call| call.action == InterfaceAction::Resume && call.name == DEFAULT_IFACE));

    let err = test_node.node.set_interface_enabled("No Such Section", true).expect_err("unknown");
    assert!(matches!(err, NodeError::Config(_)), "got {err:?}");
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn enabling_a_tcp_client_reloads_it() {
    let transport = MemoryTransport::new();
    let dir = tempfile::tempdir().expect("dir");
    let rns_dir = dir.path().join("rns");
    std::fs::create_dir_all(&rns_dir).expect("mkdir");
    std::fs::write(
        rns_dir.join("config"),
        "\
[interfaces]
    [[Uplink]]
        type = TCPClientInterface
        enabled = no
        target_host = rns.example.org
        target_port = 4242

    [[Default Interface]]
        type = AutoInterface
        enabled = yes
",
    )
    .expect("write config");
    transport.set_interface(DEFAULT_IFACE, true);

    let factory = MemoryRouterFactory::new(transport.clone());
    let node = Node::start(
        test_support::start_options(dir.path(), "Tcp"),
        transport.clone() as Arc<dyn MeshTransport>,
        factory as Arc<dyn RouterFactory>,
    )
    .await
    .expect("start");

    node.set_interface_enabled("Uplink", true).expect("enable tcp");
    let calls = transport.interface_calls();
    assert!(
        calls.iter().any(|call| call.action == InterfaceAction::Reload && call.name == "Uplink"),
        "TCP clients reconnect via reload, got {calls:?}"
    );
    node.close();
}

#[tokio::test(start_paused = true)]
async fn interface_snapshots_merge_config_and_runtime_state() {
    let transport = MemoryTransport::new();
    transport.set_interface(DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Snapshot").await;

    let configured = test_node.node.configured_interfaces_snapshot();
    let entries = configured.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], DEFAULT_IFACE);
    assert_eq!(entries[0]["type"], "AutoInterface");
    assert_eq!(entries[0]["enabled"], true);

    let stats = test_node.node.interface_stats_snapshot();
    let entries = stats.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], DEFAULT_IFACE);
    assert_eq!(entries[0]["online"], true);
    assert_eq!(entries[0]["enabled"], true);
    test_node.node.close();
}
