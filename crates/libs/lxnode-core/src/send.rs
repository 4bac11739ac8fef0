//! Outbound message composition and submission.

use rmpv::Value;
use sha2::{Digest, Sha256};

use crate::contacts::parse_dest_hash_hex;
use crate::error::NodeError;
use crate::message::{DeliveryMethod, OutboundMessage, SendReceipt};
use crate::node::Node;

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub title: String,
    pub content: Vec<u8>,
    pub fields: Option<Value>,
    pub method: DeliveryMethod,
    pub stamp_cost: Option<u8>,
    pub include_ticket: bool,
}

impl SendOptions {
    pub fn text(content: &str) -> Self {
        Self { content: content.as_bytes().to_vec(), ..Self::default() }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

pub(crate) fn send_message(
    node: &Node,
    destination_hex: &str,
    options: SendOptions,
) -> Result<SendReceipt, NodeError> {
    let destination = parse_dest_hash_hex(destination_hex)?;
    let destination_hex = hex::encode(destination);
    let source = node.destination_hash();
    let loopback = destination == source;
    if !loopback && node.transport().recall(&destination).is_none() {
        return Err(NodeError::UnknownIdentity);
    }

    let message = OutboundMessage {
        source,
        destination,
        title: options.title,
        content: options.content,
        fields: options.fields,
        method: options.method,
        stamp_cost: options.stamp_cost,
        include_ticket: options.include_ticket,
    };

    let router = node.router();
    if loopback {
        // short-circuit through the router's local entry point; the message
        // never touches an outbound destination
        let packed = router.pack(&message)?;
        if !router.local_delivery(&packed) {
            return Err(NodeError::LoopbackDelivery);
        }
        let digest = Sha256::digest(&packed);
        return Ok(SendReceipt {
            message_id: hex::encode(&digest[..16]),
            destination: destination_hex,
        });
    }
    router.handle_outbound(&message).map_err(NodeError::from)
}
