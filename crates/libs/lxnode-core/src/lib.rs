//! Control core of a peer-to-peer LXMF messaging node.
//!
//! A [`node::Node`] owns a long-lived identity on a mesh transport, keeps a
//! delivery and a profile destination registered, announces itself with a
//! composed payload, watches interface liveness across suspend/resume, and
//! exchanges avatar and attachment blobs with peers over request-scoped
//! links. The transport and the LXMF router are collaborators reached
//! through the trait contracts in [`transport`].

pub mod announces;
pub mod attachments;
pub mod avatar;
pub mod config;
pub mod contacts;
pub mod error;
pub mod message;
pub mod node;
pub mod profile;
pub mod send;
pub mod transport;
pub mod wire;

mod announce;
mod interfaces;
mod support;

pub use announces::AnnounceEntry;
pub use attachments::{AttachmentDescriptor, AttachmentDirection};
pub use avatar::AvatarRecord;
pub use contacts::ContactInfo;
pub use error::NodeError;
pub use message::{DeliveryMethod, InboundMessage, OutboundMessage, SendReceipt};
pub use node::{InboundHandler, Node, StartOptions};
pub use profile::{FetchedAttachment, FetchedAvatar};
pub use send::SendOptions;
