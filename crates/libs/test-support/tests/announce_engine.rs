mod common;

use std::time::Duration;

use lxnode_core::wire;
use test_support::{MemoryTransport, DEFAULT_IFACE};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 9, 9, 9];

#[tokio::test(start_paused = true)]
async fn concurrent_triggers_coalesce_into_one_follow_up() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Coalesce").await;

    // nothing online yet: the first trigger starts gating, the other two
    // collapse into a single queued follow-up
    test_node.node.announce_delivery("a");
    test_node.node.announce_delivery("b");
    test_node.node.announce_delivery("c");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(test_node.transport.announce_log().is_empty());

    test_node.transport.set_interface(DEFAULT_IFACE, true);
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(
        test_node.transport.announce_log().len(),
        2,
        "one emission for the gating trigger, one for the coalesced follow-up"
    );
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn gating_gives_up_after_the_deadline_and_later_triggers_retry() {
    let transport = MemoryTransport::new();
    let test_node = common::start_node(transport, "Deadline").await;

    test_node.node.announce_delivery("first");
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(test_node.transport.announce_log().is_empty(), "skipped while offline");

    test_node.transport.set_interface(DEFAULT_IFACE, true);
    test_node.node.announce_delivery("second");
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(test_node.transport.announce_log().len(), 1);
    test_node.node.close();
}

#[tokio::test(start_paused = true)]
async fn periodic_ticker_announces_once_a_minute_until_close() {
    let transport = MemoryTransport::new();
    transport.set_interface(DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Periodic").await;

    tokio::time::sleep(Duration::from_secs(70)).await;
    let after_first_tick = test_node.transport.announce_log().len();
    assert_eq!(after_first_tick, 1, "one periodic announce after a minute");

    test_node.node.close();
    tokio::time::sleep(Duration::from_secs(180)).await;
    assert_eq!(
        test_node.transport.announce_log().len(),
        after_first_tick,
        "ticker stops with the node"
    );
}

#[tokio::test(start_paused = true)]
async fn emitted_app_data_carries_name_and_avatar() {
    let transport = MemoryTransport::new();
    transport.set_interface(DEFAULT_IFACE, true);
    let test_node = common::start_node(transport, "Alice").await;
    let record = test_node.node.set_avatar(PNG.to_vec(), "").expect("set avatar");

    common::announce_and_settle(&test_node).await;
    let announces = test_node.transport.announce_log();
    assert_eq!(announces.len(), 1);
    assert_eq!(announces[0].0, test_node.node.destination_hash_hex());

    let decoded = wire::decode_announce_app_data(&announces[0].1).expect("decode app data");
    assert_eq!(decoded.display_name.as_deref(), Some("Alice"));
    assert_eq!(decoded.stamp_cost, None);
    let avatar = decoded.avatar.expect("avatar metadata");
    assert_eq!(avatar.fingerprint, record.fingerprint.to_vec());
    assert_eq!(avatar.mime, "image/png");
    assert_eq!(avatar.size, PNG.len() as u64);
    assert_eq!(avatar.mtime, record.mtime);

    // clearing the avatar drops the third element back to nil
    test_node.node.clear_avatar().expect("clear");
    test_node.node.set_display_name("Alice Cooper");
    common::announce_and_settle(&test_node).await;
    let announces = test_node.transport.announce_log();
    let decoded = wire::decode_announce_app_data(&announces[1].1).expect("decode app data");
    assert_eq!(decoded.display_name.as_deref(), Some("Alice Cooper"));
    assert!(decoded.avatar.is_none());
    test_node.node.close();
}
