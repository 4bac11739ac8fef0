//! In-memory transport and router collaborators.
//!
//! Several `MemoryTransport` instances can share one hub, giving tests a
//! tiny mesh: announces from one instance reach the observers of the
//! others, links resolve against the destinations registered anywhere on
//! the hub, and resources land in backing files under a shared temp dir.
//! All interface mutations are recorded for assertions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand_core::{OsRng, RngCore};
use rmpv::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::mpsc;

use lxnode_core::message::{InboundMessage, OutboundMessage, SendReceipt};
use lxnode_core::transport::{
    AnnounceObservation, ConcludedResource, DeliveryCallback, DestHash, DestinationSpec,
    InboundDestination, IncomingRequest, InterfaceStatus, LinkEvent, LinkEventSender, LinkId,
    LocalIdentity, LxmfRouter, MeshLink, MeshTransport, PeerIdentity, RecalledIdentity,
    RequestHandler, RequestOutcome, RequestOutcomeSender, ResourceEventSender, RouterError,
    RouterFactory, TransportError, TransportOpenOptions,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceAction {
    Halt,
    Resume,
    Reload,
}

#[derive(Clone, Debug)]
pub struct InterfaceCall {
    pub action: InterfaceAction,
    pub name: String,
    pub at: tokio::time::Instant,
}

struct Observer {
    owner: usize,
    sender: mpsc::UnboundedSender<AnnounceObservation>,
}

#[derive(Clone)]
struct RegisteredDestination {
    handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
}

#[derive(Clone)]
struct AnnounceRecord {
    identity: PeerIdentity,
    app_data: Vec<u8>,
}

struct Hub {
    tmp: TempDir,
    destinations: Mutex<HashMap<DestHash, RegisteredDestination>>,
    announced: Mutex<HashMap<DestHash, AnnounceRecord>>,
    links: Mutex<HashMap<LinkId, Arc<LinkShared>>>,
    observers: Mutex<HashMap<u64, Observer>>,
    interfaces: Mutex<Vec<InterfaceStatus>>,
    calls: Mutex<Vec<InterfaceCall>>,
    announce_log: Mutex<Vec<(DestHash, Vec<u8>)>>,
    next_observer: AtomicU64,
    next_transport: AtomicUsize,
    next_resource: AtomicUsize,
    fail_links: AtomicBool,
    links_opened: AtomicUsize,
    resources_sent: AtomicUsize,
}

impl Hub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            tmp: TempDir::new().expect("hub temp dir"),
            destinations: Mutex::new(HashMap::new()),
            announced: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            interfaces: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            announce_log: Mutex::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            next_transport: AtomicUsize::new(1),
            next_resource: AtomicUsize::new(1),
            fail_links: AtomicBool::new(false),
            links_opened: AtomicUsize::new(0),
            resources_sent: AtomicUsize::new(0),
        })
    }

    fn record_call(&self, action: InterfaceAction, name: &str) {
        self.calls.lock().expect("calls").push(InterfaceCall {
            action,
            name: name.to_string(),
            at: tokio::time::Instant::now(),
        });
    }

    fn set_interface_online(&self, name: &str, online: bool) {
        let mut interfaces = self.interfaces.lock().expect("interfaces");
        match interfaces.iter_mut().find(|status| status.name == name) {
            Some(status) => status.online = online,
            None => interfaces.push(InterfaceStatus {
                name: name.to_string(),
                short_name: None,
                online,
            }),
        }
    }

    fn broadcast_announce(&self, owner: usize, destination: DestHash, app_data: &[u8]) {
        let observers = self.observers.lock().expect("observers");
        for observer in observers.values() {
            // a node never observes its own announces
            if observer.owner == owner {
                continue;
            }
            let _ = observer.sender.send(AnnounceObservation {
                destination,
                app_data: app_data.to_vec(),
            });
        }
    }
}

fn peer_identity_from_private(private: &[u8]) -> PeerIdentity {
    let mut hasher = Sha256::new();
    hasher.update(b"public");
    hasher.update(private);
    let public_key = hasher.finalize().to_vec();
    let digest = Sha256::digest(&public_key);
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    PeerIdentity { hash, public_key }
}

fn derive_destination_hash(peer: &PeerIdentity, spec: &DestinationSpec) -> DestHash {
    let mut hasher = Sha256::new();
    hasher.update(peer.hash);
    hasher.update(spec.full_name().as_bytes());
    let digest = hasher.finalize();
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&digest[..16]);
    hash
}

pub struct MemoryTransport {
    id: usize,
    hub: Arc<Hub>,
    open_options: Mutex<Option<TransportOpenOptions>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        let hub = Hub::new();
        Arc::new(Self {
            id: hub.next_transport.fetch_add(1, Ordering::Relaxed),
            hub,
            open_options: Mutex::new(None),
        })
    }

    /// A second transport instance on the same hub, as a peer process.
    pub fn joined(&self) -> Arc<Self> {
        Arc::new(Self {
            id: self.hub.next_transport.fetch_add(1, Ordering::Relaxed),
            hub: self.hub.clone(),
            open_options: Mutex::new(None),
        })
    }

    pub fn set_interface(&self, name: &str, online: bool) {
        self.hub.set_interface_online(name, online);
    }

    pub fn set_fail_links(&self, fail: bool) {
        self.hub.fail_links.store(fail, Ordering::Relaxed);
    }

    pub fn interface_calls(&self) -> Vec<InterfaceCall> {
        self.hub.calls.lock().expect("calls").clone()
    }

    pub fn links_opened(&self) -> usize {
        self.hub.links_opened.load(Ordering::Relaxed)
    }

    pub fn resources_sent(&self) -> usize {
        self.hub.resources_sent.load(Ordering::Relaxed)
    }

    /// Every announce emitted on the hub, oldest first.
    pub fn announce_log(&self) -> Vec<(String, Vec<u8>)> {
        self.hub
            .announce_log
            .lock()
            .expect("announce log")
            .iter()
            .map(|(destination, app_data)| (hex::encode(destination), app_data.clone()))
            .collect()
    }

    pub fn open_options(&self) -> Option<TransportOpenOptions> {
        self.open_options.lock().expect("open options").clone()
    }

    pub fn observer_count(&self) -> usize {
        self.hub.observers.lock().expect("observers").len()
    }
}

impl MeshTransport for MemoryTransport {
    fn open(&self, options: &TransportOpenOptions) -> Result<(), TransportError> {
        let mut guard = self.open_options.lock().expect("open options");
        if guard.is_none() {
            *guard = Some(options.clone());
        }
        Ok(())
    }

    fn create_identity(&self) -> Result<LocalIdentity, TransportError> {
        let mut private_bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut private_bytes);
        self.load_identity(&private_bytes)
    }

    fn load_identity(&self, private_bytes: &[u8]) -> Result<LocalIdentity, TransportError> {
        if private_bytes.len() < 32 {
            return Err(TransportError::Unavailable("identity bytes too short".to_string()));
        }
        let peer = peer_identity_from_private(private_bytes);
        Ok(LocalIdentity { hash: peer.hash, private_bytes: private_bytes.to_vec() })
    }

    fn local_peer_identity(&self, identity: &LocalIdentity) -> PeerIdentity {
        peer_identity_from_private(&identity.private_bytes)
    }

    fn register_inbound(
        &self,
        identity: &LocalIdentity,
        spec: &DestinationSpec,
    ) -> Result<Arc<dyn InboundDestination>, TransportError> {
        let peer = peer_identity_from_private(&identity.private_bytes);
        let hash = derive_destination_hash(&peer, spec);
        let handlers = Arc::new(Mutex::new(HashMap::new()));
        self.hub
            .destinations
            .lock()
            .expect("destinations")
            .insert(hash, RegisteredDestination { handlers: handlers.clone() });
        Ok(Arc::new(MemoryInboundDestination {
            hub: self.hub.clone(),
            owner: self.id,
            hash,
            identity: peer,
            handlers,
        }))
    }

    fn destination_hash(&self, peer: &PeerIdentity, spec: &DestinationSpec) -> DestHash {
        derive_destination_hash(peer, spec)
    }

    fn recall(&self, destination: &DestHash) -> Option<RecalledIdentity> {
        self.hub.announced.lock().expect("announced").get(destination).map(|record| {
            RecalledIdentity { identity: record.identity.clone(), app_data: record.app_data.clone() }
        })
    }

    fn has_path(&self, destination: &DestHash) -> bool {
        self.hub.announced.lock().expect("announced").contains_key(destination)
            || self.hub.destinations.lock().expect("destinations").contains_key(destination)
    }

    fn request_path(&self, _destination: &DestHash) {}

    fn open_link(
        &self,
        peer: &PeerIdentity,
        spec: &DestinationSpec,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MeshLink>, TransportError> {
        self.hub.links_opened.fetch_add(1, Ordering::Relaxed);
        let target = derive_destination_hash(peer, spec);
        let destination = self.hub.destinations.lock().expect("destinations").get(&target).cloned();
        let Some(destination) = destination else {
            let _ = events.try_send(LinkEvent::Closed);
            return Ok(Arc::new(MemoryLink { shared: LinkShared::dangling(self.hub.clone()) }));
        };
        if self.hub.fail_links.load(Ordering::Relaxed) {
            let _ = events.try_send(LinkEvent::Closed);
            return Ok(Arc::new(MemoryLink { shared: LinkShared::dangling(self.hub.clone()) }));
        }
        let shared = LinkShared::new(self.hub.clone(), destination.handlers.clone());
        self.hub.links.lock().expect("links").insert(shared.id, shared.clone());
        let _ = events.try_send(LinkEvent::Established);
        Ok(Arc::new(MemoryLink { shared }))
    }

    fn active_link(&self, id: &LinkId) -> Option<Arc<dyn MeshLink>> {
        self.hub
            .links
            .lock()
            .expect("links")
            .get(id)
            .cloned()
            .map(|shared| Arc::new(MemoryLink { shared }) as Arc<dyn MeshLink>)
    }

    fn interface_stats(&self) -> Vec<InterfaceStatus> {
        self.hub.interfaces.lock().expect("interfaces").clone()
    }

    fn halt_interface(&self, name: &str) -> Result<(), TransportError> {
        self.hub.record_call(InterfaceAction::Halt, name);
        self.hub.set_interface_online(name, false);
        Ok(())
    }

    fn resume_interface(&self, name: &str) -> Result<(), TransportError> {
        // resuming re-creates sockets; whether they come online again is up
        // to the test, not the transport
        self.hub.record_call(InterfaceAction::Resume, name);
        Ok(())
    }

    fn reload_interface(&self, name: &str) -> Result<(), TransportError> {
        self.hub.record_call(InterfaceAction::Reload, name);
        Ok(())
    }

    fn add_announce_observer(
        &self,
        observer: mpsc::UnboundedSender<AnnounceObservation>,
    ) -> u64 {
        let id = self.hub.next_observer.fetch_add(1, Ordering::Relaxed);
        self.hub
            .observers
            .lock()
            .expect("observers")
            .insert(id, Observer { owner: self.id, sender: observer });
        id
    }

    fn remove_announce_observer(&self, id: u64) {
        self.hub.observers.lock().expect("observers").remove(&id);
    }
}

struct MemoryInboundDestination {
    hub: Arc<Hub>,
    owner: usize,
    hash: DestHash,
    identity: PeerIdentity,
    handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
}

impl InboundDestination for MemoryInboundDestination {
    fn destination_hash(&self) -> DestHash {
        self.hash
    }

    fn announce(&self, app_data: &[u8]) -> Result<(), TransportError> {
        self.hub.announced.lock().expect("announced").insert(
            self.hash,
            AnnounceRecord { identity: self.identity.clone(), app_data: app_data.to_vec() },
        );
        self.hub.announce_log.lock().expect("announce log").push((self.hash, app_data.to_vec()));
        self.hub.broadcast_announce(self.owner, self.hash, app_data);
        Ok(())
    }

    fn set_request_handler(&self, path: &str, handler: RequestHandler) {
        self.handlers.lock().expect("handlers").insert(path.to_string(), handler);
    }
}

struct LinkShared {
    id: LinkId,
    hub: Arc<Hub>,
    handlers: Arc<Mutex<HashMap<String, RequestHandler>>>,
    accepted: Mutex<Option<ResourceEventSender>>,
    identified: Mutex<Option<DestHash>>,
    closed: AtomicBool,
}

impl LinkShared {
    fn new(hub: Arc<Hub>, handlers: Arc<Mutex<HashMap<String, RequestHandler>>>) -> Arc<Self> {
        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        Arc::new(Self {
            id,
            hub,
            handlers,
            accepted: Mutex::new(None),
            identified: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Stand-in for a link whose establishment already failed.
    fn dangling(hub: Arc<Hub>) -> Arc<Self> {
        let shared = Self::new(hub, Arc::new(Mutex::new(HashMap::new())));
        shared.closed.store(true, Ordering::Relaxed);
        shared
    }
}

pub struct MemoryLink {
    shared: Arc<LinkShared>,
}

impl MeshLink for MemoryLink {
    fn id(&self) -> LinkId {
        self.shared.id
    }

    fn identify(&self, identity: &LocalIdentity) {
        let peer = peer_identity_from_private(&identity.private_bytes);
        *self.shared.identified.lock().expect("identified") = Some(peer.hash);
    }

    fn request(&self, path: &str, payload: &[u8], outcome: RequestOutcomeSender) {
        if self.shared.closed.load(Ordering::Relaxed) {
            let _ = outcome.try_send(RequestOutcome::Failed("link closed".to_string()));
            return;
        }
        let handler = self.shared.handlers.lock().expect("handlers").get(path).cloned();
        let Some(handler) = handler else {
            let _ = outcome.try_send(RequestOutcome::Failed(format!("no handler for {path}")));
            return;
        };
        let decoded = {
            let mut cursor = std::io::Cursor::new(payload);
            rmpv::decode::read_value(&mut cursor).unwrap_or(Value::Nil)
        };
        let request = IncomingRequest {
            path: path.to_string(),
            payload: decoded,
            link_id: Some(self.shared.id),
            remote_identity: *self.shared.identified.lock().expect("identified"),
        };
        let response = handler(request);
        let _ = outcome.try_send(RequestOutcome::Response(response));
    }

    fn send_resource(&self, bytes: &[u8], metadata: &Value) -> Result<(), TransportError> {
        let accepted = self.shared.accepted.lock().expect("accepted").clone();
        let Some(accepted) = accepted else {
            return Err(TransportError::Link("peer does not accept resources".to_string()));
        };
        let index = self.shared.hub.next_resource.fetch_add(1, Ordering::Relaxed);
        let backing_file: PathBuf = self.shared.hub.tmp.path().join(format!("resource-{index}.bin"));
        std::fs::write(&backing_file, bytes)?;
        self.shared.hub.resources_sent.fetch_add(1, Ordering::Relaxed);
        let _ = accepted.try_send(ConcludedResource {
            ok: true,
            metadata: Some(metadata.clone()),
            backing_file: Some(backing_file),
        });
        Ok(())
    }

    fn accept_resources(&self, concluded: ResourceEventSender) {
        *self.shared.accepted.lock().expect("accepted") = Some(concluded);
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::Relaxed) {
            self.shared.hub.links.lock().expect("links").remove(&self.shared.id);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PackedLxm {
    #[serde(with = "serde_bytes")]
    source: Vec<u8>,
    #[serde(with = "serde_bytes")]
    destination: Vec<u8>,
    title: String,
    #[serde(with = "serde_bytes")]
    content: Vec<u8>,
}

pub struct MemoryRouter {
    transport: Arc<MemoryTransport>,
    callback: Mutex<Option<DeliveryCallback>>,
    outbound: Mutex<Vec<OutboundMessage>>,
    exited: AtomicBool,
}

impl MemoryRouter {
    fn new(transport: Arc<MemoryTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            callback: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
        })
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.lock().expect("outbound").len()
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::Relaxed)
    }
}

impl LxmfRouter for MemoryRouter {
    fn register_delivery_identity(
        &self,
        identity: &LocalIdentity,
        _stamp_cost: Option<u8>,
    ) -> Result<Arc<dyn InboundDestination>, RouterError> {
        self.transport
            .register_inbound(identity, &DestinationSpec::lxmf_delivery())
            .map_err(|err| RouterError::Unavailable(err.to_string()))
    }

    fn set_delivery_callback(&self, callback: DeliveryCallback) {
        *self.callback.lock().expect("callback") = Some(callback);
    }

    fn handle_outbound(&self, message: &OutboundMessage) -> Result<SendReceipt, RouterError> {
        let packed = self.pack(message)?;
        self.outbound.lock().expect("outbound").push(message.clone());
        let digest = Sha256::digest(&packed);
        Ok(SendReceipt {
            message_id: hex::encode(&digest[..16]),
            destination: hex::encode(message.destination),
        })
    }

    fn pack(&self, message: &OutboundMessage) -> Result<Vec<u8>, RouterError> {
        let packed = PackedLxm {
            source: message.source.to_vec(),
            destination: message.destination.to_vec(),
            title: message.title.clone(),
            content: message.content.clone(),
        };
        rmp_serde::to_vec(&packed).map_err(|err| RouterError::Rejected(err.to_string()))
    }

    fn local_delivery(&self, packed: &[u8]) -> bool {
        let Ok(decoded) = rmp_serde::from_slice::<PackedLxm>(packed) else {
            return false;
        };
        let (Ok(source), Ok(destination)) = (
            DestHash::try_from(decoded.source.as_slice()),
            DestHash::try_from(decoded.destination.as_slice()),
        ) else {
            return false;
        };
        let callback = self.callback.lock().expect("callback").clone();
        let Some(callback) = callback else {
            return false;
        };
        let digest = Sha256::digest(packed);
        callback(InboundMessage {
            id: hex::encode(&digest[..16]),
            source,
            destination,
            title: decoded.title,
            content: decoded.content,
            fields: None,
        });
        true
    }

    fn exit(&self) {
        self.exited.store(true, Ordering::Relaxed);
    }
}

pub struct MemoryRouterFactory {
    transport: Arc<MemoryTransport>,
    routers: Mutex<Vec<Arc<MemoryRouter>>>,
}

impl MemoryRouterFactory {
    pub fn new(transport: Arc<MemoryTransport>) -> Arc<Self> {
        Arc::new(Self { transport, routers: Mutex::new(Vec::new()) })
    }

    pub fn open_count(&self) -> usize {
        self.routers.lock().expect("routers").len()
    }

    pub fn last(&self) -> Option<Arc<MemoryRouter>> {
        self.routers.lock().expect("routers").last().cloned()
    }
}

impl RouterFactory for MemoryRouterFactory {
    fn open(&self, _storage_dir: &std::path::Path) -> Result<Arc<dyn LxmfRouter>, RouterError> {
        let router = MemoryRouter::new(self.transport.clone());
        self.routers.lock().expect("routers").push(router.clone());
        Ok(router)
    }
}
