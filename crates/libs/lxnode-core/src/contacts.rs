//! Peer identity and contact-info recall.
//!
//! Recall itself is purely local; when a caller is willing to wait, a path
//! request is issued first so peers and transport nodes re-announce the
//! identity together with its app-data.

use std::time::Duration;

use crate::error::NodeError;
use crate::transport::{DestHash, MeshTransport, RecalledIdentity, DEST_HASH_LEN};
use crate::wire::{self, AvatarAnnounce};

const CONTACT_RECALL_POLL: Duration = Duration::from_millis(120);
const IDENTITY_RECALL_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default)]
pub struct ContactInfo {
    pub destination: String,
    pub has_identity: bool,
    pub display_name: Option<String>,
    pub stamp_cost: Option<u8>,
    pub avatar: Option<AvatarAnnounce>,
}

pub fn parse_dest_hash_hex(value: &str) -> Result<DestHash, NodeError> {
    let bytes = hex::decode(value.trim())
        .map_err(|_| NodeError::InvalidDestination(value.to_string()))?;
    if bytes.len() != DEST_HASH_LEN {
        return Err(NodeError::InvalidDestination(value.to_string()));
    }
    let mut out = [0u8; DEST_HASH_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Resolve display name, stamp cost and avatar metadata for a destination.
/// A zero timeout returns whatever the local cache holds and performs no
/// network I/O at all.
pub async fn contact_info(
    transport: &dyn MeshTransport,
    destination_hex: &str,
    timeout: Duration,
) -> Result<ContactInfo, NodeError> {
    let destination = parse_dest_hash_hex(destination_hex)?;
    let destination_hex = hex::encode(destination);
    if timeout.is_zero() {
        return Ok(build_contact_info(destination_hex, transport.recall(&destination)));
    }

    transport.request_path(&destination);
    let deadline = tokio::time::Instant::now() + timeout;
    let mut recalled = transport.recall(&destination);
    loop {
        if recalled.as_ref().is_some_and(|r| !r.app_data.is_empty()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(CONTACT_RECALL_POLL).await;
        recalled = transport.recall(&destination);
    }
    Ok(build_contact_info(destination_hex, recalled))
}

fn build_contact_info(destination: String, recalled: Option<RecalledIdentity>) -> ContactInfo {
    let Some(recalled) = recalled else {
        return ContactInfo { destination, ..ContactInfo::default() };
    };
    let decoded = wire::decode_announce_app_data(&recalled.app_data).unwrap_or_default();
    ContactInfo {
        destination,
        has_identity: true,
        display_name: decoded.display_name,
        stamp_cost: decoded.stamp_cost,
        avatar: decoded.avatar,
    }
}

/// Poll local recall until an identity for `destination` is known. `None`
/// waits without a deadline; a path request is issued when the cache starts
/// out empty.
pub async fn wait_for_identity(
    transport: &dyn MeshTransport,
    destination: &DestHash,
    timeout: Option<Duration>,
) -> Result<RecalledIdentity, NodeError> {
    if let Some(recalled) = transport.recall(destination) {
        return Ok(recalled);
    }
    transport.request_path(destination);
    let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    loop {
        if let Some(recalled) = transport.recall(destination) {
            return Ok(recalled);
        }
        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Err(NodeError::UnknownIdentity);
            }
        }
        tokio::time::sleep(IDENTITY_RECALL_POLL).await;
    }
}
