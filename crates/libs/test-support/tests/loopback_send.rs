mod common;

use std::sync::{Arc, Mutex};

use lxnode_core::{InboundMessage, NodeError, SendOptions};
use test_support::MemoryTransport;

#[tokio::test(start_paused = true)]
async fn self_send_goes_through_the_local_entry_point() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Loop").await;

    let received: Arc<Mutex<Vec<InboundMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    test_node.node.set_inbound_handler(Arc::new(move |message| {
        sink.lock().expect("received").push(message);
    }));

    let destination = test_node.node.destination_hash_hex();
    let receipt = test_node
        .node
        .send(&destination, SendOptions::text("hi").with_title("t"))
        .expect("loopback send");
    assert!(!receipt.message_id.is_empty());
    assert_eq!(receipt.destination, destination);

    let received = received.lock().expect("received");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].title, "t");
    assert_eq!(received[0].content_utf8(), "hi");
    assert_eq!(received[0].source_hex(), destination);

    // the loopback never reaches the outbound queue or opens a link
    let router = test_node.factory.last().expect("router");
    assert_eq!(router.outbound_count(), 0);
    assert_eq!(test_node.transport.links_opened(), 0);
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn send_to_unknown_identity_is_rejected() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Loop").await;
    let err = test_node
        .node
        .send(&"ee".repeat(16), SendOptions::text("hello"))
        .expect_err("no identity known");
    assert!(matches!(err, NodeError::UnknownIdentity), "got {err:?}");

    let err = test_node.node.send("not-hex", SendOptions::text("x")).expect_err("bad hash");
    assert!(matches!(err, NodeError::InvalidDestination(_)), "got {err:?}");
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn known_peer_send_enters_the_outbound_queue() {
    let transport = MemoryTransport::new();
    let node_a = common::start_node(transport.clone(), "A").await;
    let node_b = common::start_node(node_a.transport.joined(), "B").await;
    node_a.transport.set_interface(test_support::DEFAULT_IFACE, true);
    common::announce_and_settle(&node_b).await;

    let receipt = node_a
        .node
        .send(&node_b.node.destination_hash_hex(), SendOptions::text("over the mesh"))
        .expect("send to announced peer");
    assert_eq!(receipt.destination, node_b.node.destination_hash_hex());
    let router = node_a.factory.last().expect("router");
    assert_eq!(router.outbound_count(), 1);
    node_a.node.close();
    node_b.node.close();
}
