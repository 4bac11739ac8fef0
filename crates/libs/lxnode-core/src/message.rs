use crate::transport::DestHash;
use rmpv::Value;

/// How the LXMF router should move a message towards its destination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMethod {
    /// Single encrypted packet, no link setup. The default.
    #[default]
    Opportunistic,
    /// Established link to the destination.
    Direct,
    /// Store-and-forward via a propagation node.
    Propagated,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opportunistic => "opportunistic",
            Self::Direct => "direct",
            Self::Propagated => "propagated",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OutboundMessage {
    pub source: DestHash,
    pub destination: DestHash,
    pub title: String,
    pub content: Vec<u8>,
    pub fields: Option<Value>,
    pub method: DeliveryMethod,
    pub stamp_cost: Option<u8>,
    pub include_ticket: bool,
}

/// A delivered message as handed to the inbound handler.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub id: String,
    pub source: DestHash,
    pub destination: DestHash,
    pub title: String,
    pub content: Vec<u8>,
    pub fields: Option<Value>,
}

impl InboundMessage {
    pub fn source_hex(&self) -> String {
        hex::encode(self.source)
    }

    pub fn content_utf8(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

#[derive(Clone, Debug)]
pub struct SendReceipt {
    pub message_id: String,
    pub destination: String,
}
