//! Node lifecycle and public control surface.
//!
//! One `Node` per process: the transport underneath is a process-wide
//! singleton, so `close` tears down everything the node owns but leaves the
//! transport running.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::announce::{self, AnnounceGate};
use crate::announces::{AnnounceEntry, AnnounceRegistry};
use crate::attachments::{AttachmentDescriptor, AttachmentStore};
use crate::avatar::{AvatarRecord, AvatarStore};
use crate::config::{self, InterfaceConfig, RnsConfig};
use crate::contacts::{self, parse_dest_hash_hex, ContactInfo};
use crate::error::NodeError;
use crate::interfaces::{self, InterfaceController};
use crate::message::{InboundMessage, SendReceipt};
use crate::profile::{self, FetchedAttachment, FetchedAvatar};
use crate::send::{self, SendOptions};
use crate::support::{normalize_display_name, now_epoch_secs};
use crate::transport::{
    AnnounceObservation, DestHash, DestinationSpec, InboundDestination, LocalIdentity, LxmfRouter,
    MeshTransport, PeerIdentity, RouterFactory, TransportOpenOptions,
};

pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct StartOptions {
    /// Root of the node's storage tree.
    pub dir: PathBuf,
    /// Externally managed transport config directory; the managed one under
    /// `<dir>/rns` is used when unset.
    pub transport_config_dir: Option<PathBuf>,
    pub display_name: String,
    pub log_level: u8,
    pub log_file: Option<PathBuf>,
    /// Stamp cost required from senders, forwarded to the router.
    pub stamp_cost: Option<u8>,
    pub reset_lxmf_state: bool,
    pub reset_rns_config: bool,
}

impl StartOptions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            transport_config_dir: None,
            display_name: String::new(),
            log_level: 4,
            log_file: None,
            stamp_cost: None,
            reset_lxmf_state: false,
            reset_rns_config: false,
        }
    }
}

pub struct Node {
    dir: PathBuf,
    rns_config_dir: PathBuf,
    transport: Arc<dyn MeshTransport>,
    router_factory: Arc<dyn RouterFactory>,
    identity: LocalIdentity,
    stamp_cost: Option<u8>,
    display_name: Mutex<String>,
    avatar_store: AvatarStore,
    avatar: Mutex<AvatarRecord>,
    attachments: AttachmentStore,
    announces: AnnounceRegistry,
    announce_gate: AnnounceGate,
    interfaces: InterfaceController,
    router: Mutex<Arc<dyn LxmfRouter>>,
    delivery: Mutex<Arc<dyn InboundDestination>>,
    profile: Arc<dyn InboundDestination>,
    inbound: Mutex<Option<InboundHandler>>,
    observer_id: u64,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Node {
    /// Bring a node up: storage tree, configs, transport, identity, router,
    /// destinations, request handlers, announce observer, and the periodic
    /// announce + watchdog workers. Startup failures are fatal and
    /// propagated; two concurrent starts in one process are not supported.
    pub async fn start(
        options: StartOptions,
        transport: Arc<dyn MeshTransport>,
        router_factory: Arc<dyn RouterFactory>,
    ) -> Result<Arc<Self>, NodeError> {
        let dir = options.dir.clone();
        if dir.as_os_str().is_empty() {
            return Err(NodeError::Config("storage directory not set".to_string()));
        }
        config::ensure_storage_tree(&dir)
            .map_err(|err| NodeError::Config(format!("storage tree: {err}")))?;
        config::ensure_lxmf_config(&dir)
            .map_err(|err| NodeError::Config(format!("daemon config: {err}")))?;
        if options.reset_lxmf_state {
            config::reset_ratchets(&dir)
                .map_err(|err| NodeError::Config(format!("ratchet reset: {err}")))?;
        }
        if options.reset_rns_config {
            config::reset_transport_config(&dir)
                .map_err(|err| NodeError::Config(format!("transport config reset: {err}")))?;
        }
        let rns_config_dir =
            config::ensure_transport_config(&dir, options.transport_config_dir.as_deref())
                .map_err(|err| NodeError::Config(format!("transport config: {err}")))?;

        transport.open(&TransportOpenOptions {
            config_dir: rns_config_dir.clone(),
            log_level: options.log_level,
            log_file: options.log_file.clone(),
        })?;

        let identity = load_or_create_identity(transport.as_ref(), &dir)?;
        let router = router_factory.open(&dir.join(config::STORAGE_DIR))?;
        let delivery = router.register_delivery_identity(&identity, options.stamp_cost)?;

        let avatar_store = AvatarStore::new(&dir);
        let avatar = avatar_store.load();
        let profile_destination = transport
            .register_inbound(&identity, &DestinationSpec::new(
                profile::PROFILE_APP_NAME,
                profile::PROFILE_ASPECT,
            ))?;

        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let observer_id = transport.add_announce_observer(announce_tx);
        let (stop_tx, _) = watch::channel(false);

        let node = Arc::new(Node {
            dir: dir.clone(),
            rns_config_dir,
            transport,
            router_factory,
            identity,
            stamp_cost: options.stamp_cost,
            display_name: Mutex::new(normalize_display_name(&options.display_name)),
            avatar_store,
            avatar: Mutex::new(avatar),
            attachments: AttachmentStore::new(&dir),
            announces: AnnounceRegistry::default(),
            announce_gate: AnnounceGate::default(),
            interfaces: InterfaceController::new(),
            router: Mutex::new(router.clone()),
            delivery: Mutex::new(delivery.clone()),
            profile: profile_destination,
            inbound: Mutex::new(None),
            observer_id,
            stop_tx,
            closed: AtomicBool::new(false),
        });

        node.install_request_handlers(delivery.as_ref());
        node.install_request_handlers(node.profile.as_ref());
        node.install_delivery_callback(router.as_ref());

        tokio::spawn(run_announce_observer(
            node.clone(),
            announce_rx,
            node.stop_tx.subscribe(),
        ));
        tokio::spawn(announce::periodic_announcer(node.clone(), node.stop_tx.subscribe()));
        tokio::spawn(run_watchdog(node.clone(), node.stop_tx.subscribe()));

        log::info!(
            "node started dir={} destination={}",
            dir.display(),
            node.destination_hash_hex()
        );
        Ok(node)
    }

    /// Stop background workers and the router, deregister the announce
    /// observer. Idempotent. The transport stays up: it is process-wide and
    /// outlives the node.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);
        self.router().exit();
        self.transport.remove_announce_observer(self.observer_id);
        log::info!("node closed destination={}", self.destination_hash_hex());
    }

    /// Rebuild the router and the delivery destination on the preserved
    /// identity, then schedule a re-announce.
    pub async fn restart(self: &Arc<Self>) -> Result<(), NodeError> {
        let router = self.router_factory.open(&self.dir.join(config::STORAGE_DIR))?;
        let delivery = router.register_delivery_identity(&self.identity, self.stamp_cost)?;
        self.install_delivery_callback(router.as_ref());
        self.install_request_handlers(delivery.as_ref());
        let previous = {
            let mut guard = self.router.lock().expect("router");
            std::mem::replace(&mut *guard, router)
        };
        previous.exit();
        *self.delivery.lock().expect("delivery destination") = delivery;
        log::info!("node restarted destination={}", self.destination_hash_hex());
        self.announce_delivery("restart");
        Ok(())
    }

    pub fn destination_hash(&self) -> DestHash {
        self.delivery.lock().expect("delivery destination").destination_hash()
    }

    pub fn destination_hash_hex(&self) -> String {
        hex::encode(self.destination_hash())
    }

    pub fn set_inbound_handler(&self, handler: InboundHandler) {
        *self.inbound.lock().expect("inbound handler") = Some(handler);
    }

    pub fn send(&self, destination_hex: &str, options: SendOptions) -> Result<SendReceipt, NodeError> {
        send::send_message(self, destination_hex, options)
    }

    /// Schedule an announce of the delivery destination. At most one attempt
    /// runs at a time; extra calls coalesce into a single follow-up.
    pub fn announce_delivery(self: &Arc<Self>, reason: &str) {
        tokio::spawn(announce::run_announce(self.clone(), reason.to_string()));
    }

    pub fn display_name(&self) -> String {
        self.display_name.lock().expect("display name").clone()
    }

    /// Takes effect on the wire with the next announce.
    pub fn set_display_name(&self, name: &str) {
        *self.display_name.lock().expect("display name") = normalize_display_name(name);
    }

    pub fn avatar(&self) -> AvatarRecord {
        self.avatar.lock().expect("avatar").clone()
    }

    /// Persist a new avatar; peers pick it up with the next announce.
    pub fn set_avatar(&self, bytes: Vec<u8>, mime: &str) -> Result<AvatarRecord, NodeError> {
        let record = self.avatar_store.set(bytes, mime)?;
        *self.avatar.lock().expect("avatar") = record.clone();
        Ok(record)
    }

    pub fn clear_avatar(&self) -> Result<(), NodeError> {
        self.avatar_store.clear()?;
        *self.avatar.lock().expect("avatar") = AvatarRecord::default();
        Ok(())
    }

    /// Resolve peer contact info. A zero timeout is answered from the local
    /// cache without any network I/O.
    pub async fn contact_info(
        &self,
        destination_hex: &str,
        timeout: Duration,
    ) -> Result<ContactInfo, NodeError> {
        contacts::contact_info(self.transport.as_ref(), destination_hex, timeout).await
    }

    /// Wait for the transport to know the identity behind a destination.
    /// `None` waits without deadline. The node's own destination resolves
    /// immediately.
    pub async fn wait_for_identity(
        &self,
        destination_hex: &str,
        timeout: Option<Duration>,
    ) -> Result<PeerIdentity, NodeError> {
        let destination = parse_dest_hash_hex(destination_hex)?;
        if destination == self.destination_hash() {
            return Ok(self.transport.local_peer_identity(&self.identity));
        }
        contacts::wait_for_identity(self.transport.as_ref(), &destination, timeout)
            .await
            .map(|recalled| recalled.identity)
    }

    pub async fn fetch_contact_avatar(
        self: &Arc<Self>,
        destination_hex: &str,
        known_fingerprint: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<FetchedAvatar, NodeError> {
        profile::fetch_contact_avatar(self, destination_hex, known_fingerprint, timeout).await
    }

    pub fn store_outgoing_attachment(
        &self,
        bytes: &[u8],
        mime: &str,
        name: &str,
    ) -> Result<AttachmentDescriptor, NodeError> {
        self.attachments.store(bytes, mime, name).map_err(NodeError::from)
    }

    pub async fn fetch_contact_attachment(
        self: &Arc<Self>,
        destination_hex: &str,
        hash_hex: &str,
        timeout: Duration,
    ) -> Result<FetchedAttachment, NodeError> {
        profile::fetch_contact_attachment(self, destination_hex, hash_hex, timeout).await
    }

    /// Toggle an interface in the transport config and apply the change to
    /// the running driver: reload for TCP clients (forces a reconnect),
    /// resume otherwise, halt on disable.
    pub fn set_interface_enabled(&self, name: &str, enabled: bool) -> Result<(), NodeError> {
        let path = self.rns_config_path();
        let mut rns_config = RnsConfig::load(&path)
            .map_err(|err| NodeError::Config(format!("transport config: {err}")))?;
        if !rns_config.set_interface_enabled(name, enabled) {
            return Err(NodeError::Config(format!("unknown interface section: {name}")));
        }
        rns_config.save(&path)?;
        let kind = rns_config
            .interfaces()
            .into_iter()
            .find(|iface| iface.name == name)
            .map(|iface| iface.kind)
            .unwrap_or_default();
        if enabled {
            if kind.starts_with("TCP") {
                self.transport.reload_interface(name)?;
            } else {
                self.transport.resume_interface(name)?;
            }
        } else {
            self.transport.halt_interface(name)?;
        }
        log::info!("interface toggled name={name} enabled={enabled}");
        Ok(())
    }

    pub fn interface_stats_snapshot(&self) -> serde_json::Value {
        let configured = self.configured_interfaces();
        let stats = self.transport.interface_stats();
        let entries: Vec<serde_json::Value> = stats
            .iter()
            .map(|status| {
                let enabled = configured
                    .iter()
                    .find(|iface| {
                        iface.name == status.name
                            || Some(iface.name.as_str()) == status.short_name.as_deref()
                    })
                    .map(|iface| iface.enabled);
                json!({
                    "name": status.name,
                    "short_name": status.short_name,
                    "online": status.online,
                    "enabled": enabled,
                })
            })
            .collect();
        json!(entries)
    }

    pub fn configured_interfaces_snapshot(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .configured_interfaces()
            .iter()
            .map(|iface| {
                json!({
                    "name": iface.name,
                    "type": iface.kind,
                    "enabled": iface.enabled,
                })
            })
            .collect();
        json!(entries)
    }

    pub fn announces_snapshot(&self) -> Vec<AnnounceEntry> {
        self.announces.snapshot()
    }

    // ------------------------------------------------------------------
    // crate-internal plumbing

    pub(crate) fn transport(&self) -> &Arc<dyn MeshTransport> {
        &self.transport
    }

    pub(crate) fn router(&self) -> Arc<dyn LxmfRouter> {
        self.router.lock().expect("router").clone()
    }

    pub(crate) fn delivery_destination(&self) -> Arc<dyn InboundDestination> {
        self.delivery.lock().expect("delivery destination").clone()
    }

    pub(crate) fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub(crate) fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub(crate) fn announce_gate(&self) -> &AnnounceGate {
        &self.announce_gate
    }

    pub(crate) fn avatar_record(&self) -> AvatarRecord {
        self.avatar()
    }

    pub(crate) fn compose_announce_app_data(&self) -> Vec<u8> {
        let display_name = self.display_name();
        let avatar = self.avatar_record().announce_entry();
        crate::wire::encode_announce_app_data(&display_name, self.stamp_cost, avatar.as_ref())
    }

    pub(crate) fn configured_interfaces(&self) -> Vec<InterfaceConfig> {
        match RnsConfig::load(&self.rns_config_path()) {
            Ok(rns_config) => rns_config.interfaces(),
            Err(err) => {
                log::debug!("transport config unreadable err={err}");
                Vec::new()
            }
        }
    }

    pub(crate) async fn reset_enabled_interfaces(&self) {
        let enabled: Vec<InterfaceConfig> =
            self.configured_interfaces().into_iter().filter(|iface| iface.enabled).collect();
        self.interfaces.reset_enabled(self.transport.as_ref(), &enabled).await;
    }

    fn rns_config_path(&self) -> PathBuf {
        self.rns_config_dir.join(config::RNS_CONFIG_FILE)
    }

    fn install_request_handlers(self: &Arc<Self>, destination: &dyn InboundDestination) {
        destination.set_request_handler(profile::AVATAR_PATH, profile::avatar_request_handler(self));
        destination
            .set_request_handler(profile::ATTACHMENT_PATH, profile::attachment_request_handler(self));
    }

    fn install_delivery_callback(self: &Arc<Self>, router: &dyn LxmfRouter) {
        let weak = Arc::downgrade(self);
        router.set_delivery_callback(Arc::new(move |message: InboundMessage| {
            if let Some(node) = weak.upgrade() {
                node.dispatch_inbound(message);
            }
        }));
    }

    fn dispatch_inbound(&self, message: InboundMessage) {
        log::debug!("inbound message id={} source={}", message.id, message.source_hex());
        let handler = self.inbound.lock().expect("inbound handler").clone();
        match handler {
            Some(handler) => handler(message),
            None => log::debug!("inbound message dropped: no handler installed"),
        }
    }
}

fn load_or_create_identity(
    transport: &dyn MeshTransport,
    dir: &Path,
) -> Result<LocalIdentity, NodeError> {
    let path = dir.join(config::IDENTITY_FILE);
    if path.exists() {
        let bytes = std::fs::read(&path)
            .map_err(|err| NodeError::Identity(format!("unreadable identity file: {err}")))?;
        return transport
            .load_identity(&bytes)
            .map_err(|err| NodeError::Identity(err.to_string()));
    }
    let identity =
        transport.create_identity().map_err(|err| NodeError::Identity(err.to_string()))?;
    std::fs::write(&path, &identity.private_bytes)
        .map_err(|err| NodeError::Identity(format!("persisting identity: {err}")))?;
    log::info!("created node identity hash={}", hex::encode(identity.hash));
    Ok(identity)
}

async fn run_announce_observer(
    node: Arc<Node>,
    mut observations: mpsc::UnboundedReceiver<AnnounceObservation>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            observation = observations.recv() => match observation {
                Some(observation) => node.announces.record(&observation, now_epoch_secs()),
                None => return,
            },
            _ = stop.changed() => return,
        }
    }
}

async fn run_watchdog(node: Arc<Node>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interfaces::WATCHDOG_TICK) => {
                let enabled: Vec<InterfaceConfig> = node
                    .configured_interfaces()
                    .into_iter()
                    .filter(|iface| iface.enabled)
                    .collect();
                let stats = node.transport.interface_stats();
                if node.interfaces.observe(tokio::time::Instant::now(), &enabled, &stats) {
                    log::warn!("all enabled interfaces offline, resetting");
                    node.interfaces.reset_enabled(node.transport.as_ref(), &enabled).await;
                }
            }
            _ = stop.changed() => return,
        }
    }
}
