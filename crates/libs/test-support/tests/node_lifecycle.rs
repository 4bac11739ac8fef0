mod common;

use std::sync::Arc;
use std::time::Duration;

use lxnode_core::node::Node;
use lxnode_core::transport::{MeshTransport, RouterFactory};
use test_support::{MemoryRouterFactory, MemoryTransport};

#[tokio::test(start_paused = true)]
async fn start_lays_out_the_storage_tree() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Tree").await;
    let dir = test_node.dir.path();
    assert!(dir.join("config").exists());
    assert!(dir.join("rns").join("config").exists());
    assert!(dir.join("storage").is_dir());
    assert!(dir.join("identity").exists());
    let identity = std::fs::read(dir.join("identity")).expect("identity bytes");
    assert!(identity.len() >= 32);
    assert_eq!(
        test_node.transport.open_options().expect("transport opened").config_dir,
        dir.join("rns")
    );
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn identity_survives_a_fresh_start_on_the_same_directory() {
    let transport = MemoryTransport::new();
    let first = common::start_node(transport.clone(), "One").await;
    let destination = first.node.destination_hash_hex();
    first.node.close();

    let factory = MemoryRouterFactory::new(transport.clone());
    let node = Node::start(
        test_support::start_options(first.dir.path(), "One"),
        transport.clone() as Arc<dyn MeshTransport>,
        factory as Arc<dyn RouterFactory>,
    )
    .await
    .expect("second start");
    assert_eq!(node.destination_hash_hex(), destination);
    node.close();
}

#[tokio::test(start_paused = true)]
async fn restart_rebuilds_router_and_reannounces() {
    let transport = MemoryTransport::new();
    transport.set_interface(test_support::DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Restart").await;
    let destination = test_node.node.destination_hash_hex();
    let first_router = test_node.factory.last().expect("router");
    assert_eq!(test_node.factory.open_count(), 1);

    test_node.node.restart().await.expect("restart");
    assert_eq!(test_node.factory.open_count(), 2);
    assert!(first_router.exited(), "previous router must be asked to exit");
    assert_eq!(test_node.node.destination_hash_hex(), destination, "identity preserved");

    tokio::time::sleep(Duration::from_secs(3)).await;
    let announces = test_node.transport.announce_log();
    assert!(!announces.is_empty(), "restart schedules a re-announce");
    assert_eq!(announces[0].0, destination);
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_leaves_the_transport_up() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Close").await;
    assert_eq!(test_node.transport.observer_count(), 1);
    let router = test_node.factory.last().expect("router");

    test_node.node.close();
    test_node.node.close();
    assert!(router.exited());
    assert_eq!(test_node.transport.observer_count(), 0);
    // the transport keeps serving the process after close
    assert!(test_node.transport.open_options().is_some());
}

#[tokio::test(start_paused = true)]
async fn reset_flag_clears_the_ratchet_state() {
    let transport = MemoryTransport::new();
    let dir = tempfile::tempdir().expect("dir");
    let ratchets = dir.path().join("storage").join("ratchets");
    std::fs::create_dir_all(&ratchets).expect("seed ratchets");
    std::fs::write(ratchets.join("peer"), b"ratchet").expect("seed file");
    test_support::write_minimal_rns_config(dir.path());

    let mut options = test_support::start_options(dir.path(), "Reset");
    options.reset_lxmf_state = true;
    let factory = MemoryRouterFactory::new(transport.clone());
    let node = Node::start(
        options,
        transport as Arc<dyn MeshTransport>,
        factory as Arc<dyn RouterFactory>,
    )
    .await
    .expect("start");
    assert!(!ratchets.exists(), "ratchet state must be removed");
    node.close();
}
