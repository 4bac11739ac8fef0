//! Contracts consumed from the mesh transport and the LXMF router.
//!
//! The transport is a process-wide singleton owned by the host process; the
//! node drives it exclusively through these traits so the control logic stays
//! independent of the concrete stack underneath. Callback-style methods take
//! channel senders and implementations must never block on them: bounded
//! channels are written with `try_send` and overflow is dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rmpv::Value;
use tokio::sync::mpsc;

use crate::message::{InboundMessage, OutboundMessage, SendReceipt};

pub const DEST_HASH_LEN: usize = 16;

/// Truncated destination address as it appears on the wire.
pub type DestHash = [u8; DEST_HASH_LEN];

/// Session identifier of an established link.
pub type LinkId = [u8; DEST_HASH_LEN];

/// The node's own long-lived identity. The transport produces and interprets
/// the private bytes; the node only persists them.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub hash: DestHash,
    pub private_bytes: Vec<u8>,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // private bytes stay out of logs
        f.debug_struct("LocalIdentity").field("hash", &hex::encode(self.hash)).finish()
    }
}

/// Public half of a peer identity as recalled from the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    pub hash: DestHash,
    pub public_key: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RecalledIdentity {
    pub identity: PeerIdentity,
    /// App-data from the most recent announce, empty when none was observed.
    pub app_data: Vec<u8>,
}

/// (app name, aspect) pair a destination is bound under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationSpec {
    pub app_name: String,
    pub aspect: String,
}

impl DestinationSpec {
    pub fn new(app_name: &str, aspect: &str) -> Self {
        Self { app_name: app_name.to_string(), aspect: aspect.to_string() }
    }

    pub fn lxmf_delivery() -> Self {
        Self::new("lxmf", "delivery")
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.app_name, self.aspect)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InterfaceStatus {
    pub name: String,
    pub short_name: Option<String>,
    pub online: bool,
}

#[derive(Clone, Debug)]
pub struct AnnounceObservation {
    pub destination: DestHash,
    pub app_data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Established,
    Closed,
}

/// Outcome of a resource transfer on a link. Received bytes are exposed
/// through a backing file next to the metadata map.
#[derive(Clone, Debug)]
pub struct ConcludedResource {
    pub ok: bool,
    pub metadata: Option<Value>,
    pub backing_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub enum RequestOutcome {
    /// Decoded response payload: a map, or raw bytes from older peers.
    Response(Value),
    Failed(String),
}

pub type LinkEventSender = mpsc::Sender<LinkEvent>;
pub type ResourceEventSender = mpsc::Sender<ConcludedResource>;
pub type RequestOutcomeSender = mpsc::Sender<RequestOutcome>;

/// An inbound request as handed to a registered request handler. Handlers run
/// on transport worker threads and must return quickly.
#[derive(Clone, Debug)]
pub struct IncomingRequest {
    pub path: String,
    pub payload: Value,
    pub link_id: Option<LinkId>,
    pub remote_identity: Option<DestHash>,
}

pub type RequestHandler = Arc<dyn Fn(IncomingRequest) -> Value + Send + Sync>;

pub type DeliveryCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("destination rejected: {0}")]
    Destination(String),
    #[error("link failed: {0}")]
    Link(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router unavailable: {0}")]
    Unavailable(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct TransportOpenOptions {
    pub config_dir: PathBuf,
    pub log_level: u8,
    pub log_file: Option<PathBuf>,
}

/// The mesh transport singleton.
pub trait MeshTransport: Send + Sync {
    /// Bring the transport up against a config directory. Idempotent: a
    /// transport that is already open keeps running with its original config.
    fn open(&self, options: &TransportOpenOptions) -> Result<(), TransportError>;

    fn create_identity(&self) -> Result<LocalIdentity, TransportError>;
    fn load_identity(&self, private_bytes: &[u8]) -> Result<LocalIdentity, TransportError>;
    /// Public view of one of our own identities, for self short-circuits.
    fn local_peer_identity(&self, identity: &LocalIdentity) -> PeerIdentity;

    fn register_inbound(
        &self,
        identity: &LocalIdentity,
        spec: &DestinationSpec,
    ) -> Result<Arc<dyn InboundDestination>, TransportError>;

    /// Address of the destination `peer` exposes under `spec`.
    fn destination_hash(&self, peer: &PeerIdentity, spec: &DestinationSpec) -> DestHash;

    /// Purely local identity recall; never performs network I/O.
    fn recall(&self, destination: &DestHash) -> Option<RecalledIdentity>;
    fn has_path(&self, destination: &DestHash) -> bool;
    fn request_path(&self, destination: &DestHash);

    fn open_link(
        &self,
        peer: &PeerIdentity,
        spec: &DestinationSpec,
        events: LinkEventSender,
    ) -> Result<Arc<dyn MeshLink>, TransportError>;

    /// Look up a currently active link by its id.
    fn active_link(&self, id: &LinkId) -> Option<Arc<dyn MeshLink>>;

    fn interface_stats(&self) -> Vec<InterfaceStatus>;
    fn halt_interface(&self, name: &str) -> Result<(), TransportError>;
    fn resume_interface(&self, name: &str) -> Result<(), TransportError>;
    fn reload_interface(&self, name: &str) -> Result<(), TransportError>;

    fn add_announce_observer(
        &self,
        observer: mpsc::UnboundedSender<AnnounceObservation>,
    ) -> u64;
    fn remove_announce_observer(&self, id: u64);
}

/// A destination of ours that can receive traffic.
pub trait InboundDestination: Send + Sync {
    fn destination_hash(&self) -> DestHash;
    /// Broadcast an announce carrying `app_data`. Sending the resulting
    /// packet is the transport's job and is best-effort.
    fn announce(&self, app_data: &[u8]) -> Result<(), TransportError>;
    fn set_request_handler(&self, path: &str, handler: RequestHandler);
}

/// A session-scoped bidirectional channel to a peer destination.
pub trait MeshLink: Send + Sync {
    fn id(&self) -> LinkId;
    fn identify(&self, identity: &LocalIdentity);
    fn request(&self, path: &str, payload: &[u8], outcome: RequestOutcomeSender);
    fn send_resource(&self, bytes: &[u8], metadata: &Value) -> Result<(), TransportError>;
    /// Accept all inbound resources on this link, reporting conclusions.
    fn accept_resources(&self, concluded: ResourceEventSender);
    fn close(&self);
}

/// The LXMF router collaborator.
pub trait LxmfRouter: Send + Sync {
    /// Register the node identity for delivery; yields the delivery-inbound
    /// destination.
    fn register_delivery_identity(
        &self,
        identity: &LocalIdentity,
        stamp_cost: Option<u8>,
    ) -> Result<Arc<dyn InboundDestination>, RouterError>;

    fn set_delivery_callback(&self, callback: DeliveryCallback);

    /// Queue a message for outbound delivery.
    fn handle_outbound(&self, message: &OutboundMessage) -> Result<SendReceipt, RouterError>;

    /// Serialise a message to its wire form.
    fn pack(&self, message: &OutboundMessage) -> Result<Vec<u8>, RouterError>;

    /// Local delivery entry point. Returns false when the router rejects the
    /// packed message.
    fn local_delivery(&self, packed: &[u8]) -> bool;

    fn exit(&self);
}

/// Builds a router over a storage directory; invoked once at start and again
/// on every restart.
pub trait RouterFactory: Send + Sync {
    fn open(&self, storage_dir: &Path) -> Result<Arc<dyn LxmfRouter>, RouterError>;
}
