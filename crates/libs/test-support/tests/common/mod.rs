use std::sync::Arc;
use std::time::Duration;

use lxnode_core::node::Node;
use lxnode_core::transport::{MeshTransport, RouterFactory};
use tempfile::TempDir;
use test_support::{MemoryRouterFactory, MemoryTransport};

pub struct TestNode {
    pub node: Arc<Node>,
    pub transport: Arc<MemoryTransport>,
    pub factory: Arc<MemoryRouterFactory>,
    pub dir: TempDir,
}

/// Start a node over the given transport, with the single-AutoInterface
/// config pre-seeded so readiness hinges on "Default Interface" alone.
pub async fn start_node(transport: Arc<MemoryTransport>, display_name: &str) -> TestNode {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("node dir");
    test_support::write_minimal_rns_config(dir.path());
    let factory = MemoryRouterFactory::new(transport.clone());
    let node = Node::start(
        test_support::start_options(dir.path(), display_name),
        transport.clone() as Arc<dyn MeshTransport>,
        factory.clone() as Arc<dyn RouterFactory>,
    )
    .await
    .expect("start node");
    TestNode { node, transport, factory, dir }
}

/// Announce and give the readiness gate time to settle and emit.
pub async fn announce_and_settle(test_node: &TestNode) {
    test_node.node.announce_delivery("test");
    tokio::time::sleep(Duration::from_secs(3)).await;
}
