//! Profile blob service: `/avatar` and `/attachment` over request-scoped
//! links.
//!
//! Responses carry metadata only; the bytes travel as a resource on the same
//! link. The fetch side therefore has to accept both orders of arrival: the
//! response map may land before or after the resource concludes. Older peers
//! answer with raw bytes inline instead of a map, which is also accepted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use rmpv::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::attachments::{content_hash_hex, is_content_hash_hex};
use crate::avatar::AvatarRecord;
use crate::contacts::{self, parse_dest_hash_hex};
use crate::error::NodeError;
use crate::node::Node;
use crate::transport::{
    DestHash, DestinationSpec, IncomingRequest, LinkEvent, PeerIdentity, RequestHandler,
    RequestOutcome,
};
use crate::wire;

pub const AVATAR_PATH: &str = "/avatar";
pub const ATTACHMENT_PATH: &str = "/attachment";

pub(crate) const PROFILE_APP_NAME: &str = "lxnode";
pub(crate) const PROFILE_ASPECT: &str = "profile";

const KIND_AVATAR: &str = "avatar";
const KIND_ATTACHMENT: &str = "attachment";

pub(crate) const DEFAULT_AVATAR_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_ATTACHMENT_TIMEOUT: Duration = Duration::from_secs(10);
const PATH_WAIT_CAP: Duration = Duration::from_secs(4);
const PATH_POLL: Duration = Duration::from_millis(150);

#[derive(Clone, Debug)]
pub struct FetchedAvatar {
    pub unchanged: bool,
    /// Base64 of the avatar bytes; `None` on the unchanged short-circuit.
    pub base64: Option<String>,
    pub fingerprint: Option<Vec<u8>>,
    pub mime: Option<String>,
    pub size: Option<u64>,
    pub mtime: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct FetchedAttachment {
    /// Location of the cached bytes on local disk.
    pub path: PathBuf,
    pub mime: Option<String>,
    pub name: Option<String>,
    /// True when no transport work was needed.
    pub from_cache: bool,
}

enum FetchOutcome {
    Unchanged { metadata: Value },
    Bytes { bytes: Vec<u8>, metadata: Option<Value> },
}

// ---------------------------------------------------------------------------
// responders

pub(crate) fn avatar_request_handler(node: &Arc<Node>) -> RequestHandler {
    let node = Arc::downgrade(node);
    Arc::new(move |request| match node.upgrade() {
        Some(node) => handle_avatar_request(&node, &request),
        None => not_ok(),
    })
}

pub(crate) fn attachment_request_handler(node: &Arc<Node>) -> RequestHandler {
    let node = Arc::downgrade(node);
    Arc::new(move |request| match node.upgrade() {
        Some(node) => handle_attachment_request(&node, &request),
        None => not_ok(),
    })
}

fn handle_avatar_request(node: &Node, request: &IncomingRequest) -> Value {
    let avatar = node.avatar_record();
    if avatar.is_empty() {
        return not_ok();
    }
    let known = wire::map_bytes(&request.payload, "h");
    if known.as_deref() == Some(&avatar.fingerprint[..]) {
        let mut pairs = vec![
            ("ok", Value::Boolean(true)),
            ("unchanged", Value::Boolean(true)),
        ];
        pairs.extend(avatar_meta_pairs(&avatar));
        return wire::string_map(pairs);
    }

    let link = match request.link_id.and_then(|id| node.transport().active_link(&id)) {
        Some(link) => link,
        None => return error_response("link not found"),
    };
    let metadata = wire::string_map(
        [("kind", Value::String(KIND_AVATAR.into()))]
            .into_iter()
            .chain(avatar_meta_pairs(&avatar))
            .collect(),
    );
    if let Err(err) = link.send_resource(&avatar.bytes, &metadata) {
        log::warn!("avatar resource send failed err={err}");
        return error_response("resource failed");
    }
    let mut pairs = vec![("ok", Value::Boolean(true))];
    pairs.extend(avatar_meta_pairs(&avatar));
    pairs.push(("resource", Value::Boolean(true)));
    wire::string_map(pairs)
}

fn handle_attachment_request(node: &Node, request: &IncomingRequest) -> Value {
    let Some(hash) = wire::map_bytes(&request.payload, "h") else {
        return not_ok();
    };
    let hash_hex = hex::encode(&hash);
    let loaded = match node.attachments().load(&hash_hex) {
        Ok(loaded) => loaded,
        Err(_) => return not_ok(),
    };
    let link = match request.link_id.and_then(|id| node.transport().active_link(&id)) {
        Some(link) => link,
        None => return error_response("link not found"),
    };
    let meta_pairs = |with_kind: bool| {
        let mut pairs = Vec::new();
        if with_kind {
            pairs.push(("kind", Value::String(KIND_ATTACHMENT.into())));
        }
        pairs.extend([
            ("h", Value::Binary(hash.clone())),
            ("t", Value::String(loaded.descriptor.mime.as_str().into())),
            ("n", Value::String(loaded.descriptor.name.as_str().into())),
            ("s", Value::from(loaded.descriptor.size)),
            ("u", Value::from(loaded.descriptor.mtime)),
        ]);
        pairs
    };
    if let Err(err) = link.send_resource(&loaded.bytes, &wire::string_map(meta_pairs(true))) {
        log::warn!("attachment resource send failed hash={hash_hex} err={err}");
        return error_response("resource failed");
    }
    let mut pairs = vec![("ok", Value::Boolean(true))];
    pairs.extend(meta_pairs(false));
    pairs.push(("resource", Value::Boolean(true)));
    wire::string_map(pairs)
}

fn avatar_meta_pairs(avatar: &AvatarRecord) -> Vec<(&'static str, Value)> {
    vec![
        ("h", Value::Binary(avatar.fingerprint.to_vec())),
        ("t", Value::String(avatar.mime.as_str().into())),
        ("s", Value::from(avatar.size())),
        ("u", Value::from(avatar.mtime)),
    ]
}

fn not_ok() -> Value {
    wire::string_map(vec![("ok", Value::Boolean(false))])
}

fn error_response(detail: &str) -> Value {
    wire::string_map(vec![
        ("ok", Value::Boolean(false)),
        ("error", Value::String(detail.into())),
    ])
}

// ---------------------------------------------------------------------------
// fetchers

pub(crate) async fn fetch_contact_avatar(
    node: &Arc<Node>,
    destination_hex: &str,
    known_fingerprint: Option<&[u8]>,
    timeout: Duration,
) -> Result<FetchedAvatar, NodeError> {
    let timeout = if timeout.is_zero() { DEFAULT_AVATAR_TIMEOUT } else { timeout };
    let destination = parse_dest_hash_hex(destination_hex)?;
    let body = match known_fingerprint {
        Some(known) => wire::string_map(vec![("h", Value::Binary(known.to_vec()))]),
        None => wire::string_map(Vec::new()),
    };
    match fetch_blob(node, &destination, AVATAR_PATH, &body, timeout, KIND_AVATAR).await? {
        FetchOutcome::Unchanged { metadata } => Ok(FetchedAvatar {
            unchanged: true,
            base64: None,
            fingerprint: wire::map_bytes(&metadata, "h"),
            mime: wire::map_string(&metadata, "t"),
            size: wire::map_u64(&metadata, "s"),
            mtime: wire::map_u64(&metadata, "u"),
        }),
        FetchOutcome::Bytes { bytes, metadata } => {
            let metadata = metadata.unwrap_or(Value::Nil);
            Ok(FetchedAvatar {
                unchanged: false,
                base64: Some(BASE64_STANDARD.encode(&bytes)),
                fingerprint: wire::map_bytes(&metadata, "h"),
                mime: wire::map_string(&metadata, "t"),
                size: wire::map_u64(&metadata, "s"),
                mtime: wire::map_u64(&metadata, "u"),
            })
        }
    }
}

pub(crate) async fn fetch_contact_attachment(
    node: &Arc<Node>,
    destination_hex: &str,
    hash_hex: &str,
    timeout: Duration,
) -> Result<FetchedAttachment, NodeError> {
    let timeout = if timeout.is_zero() { DEFAULT_ATTACHMENT_TIMEOUT } else { timeout };
    if !is_content_hash_hex(hash_hex) {
        return Err(NodeError::InvalidContentHash(hash_hex.to_string()));
    }
    let hash_hex = hash_hex.to_ascii_lowercase();
    let destination = parse_dest_hash_hex(destination_hex)?;
    let remote_hex = hex::encode(destination);

    // our own attachment: serve straight from the outbound store
    if destination == node.destination_hash() {
        let loaded = node.attachments().load(&hash_hex).map_err(|_| NodeError::NotFound)?;
        return Ok(FetchedAttachment {
            path: loaded.path,
            mime: non_empty(loaded.descriptor.mime),
            name: non_empty(loaded.descriptor.name),
            from_cache: true,
        });
    }

    if let Some(path) = node.attachments().cached_incoming(&remote_hex, &hash_hex) {
        let (mime, name) = node.attachments().cached_sidecars(&remote_hex, &hash_hex);
        return Ok(FetchedAttachment { path, mime, name, from_cache: true });
    }

    let hash = hex::decode(&hash_hex).map_err(|_| NodeError::InvalidContentHash(hash_hex.clone()))?;
    let body = wire::string_map(vec![("h", Value::Binary(hash))]);
    let outcome =
        fetch_blob(node, &destination, ATTACHMENT_PATH, &body, timeout, KIND_ATTACHMENT).await?;
    let FetchOutcome::Bytes { bytes, metadata } = outcome else {
        return Err(NodeError::Protocol("unexpected unchanged attachment response".to_string()));
    };
    if content_hash_hex(&bytes) != hash_hex {
        return Err(NodeError::Protocol("attachment bytes do not match requested hash".to_string()));
    }
    let metadata = metadata.unwrap_or(Value::Nil);
    let mime = wire::map_string(&metadata, "t").and_then(non_empty);
    let name = wire::map_string(&metadata, "n").and_then(non_empty);
    let path = node.attachments().cache_incoming(
        &remote_hex,
        &hash_hex,
        &bytes,
        mime.as_deref(),
        name.as_deref(),
    )?;
    Ok(FetchedAttachment { path, mime, name, from_cache: false })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

async fn fetch_blob(
    node: &Arc<Node>,
    destination: &DestHash,
    request_path: &str,
    body: &Value,
    timeout: Duration,
    kind: &str,
) -> Result<FetchOutcome, NodeError> {
    let deadline = Instant::now() + timeout;
    let recall_wait = timeout.min(PATH_WAIT_CAP);
    let recalled = contacts::wait_for_identity(
        node.transport().as_ref(),
        destination,
        Some(recall_wait),
    )
    .await?;
    let peer = recalled.identity;

    let candidates = [
        DestinationSpec::lxmf_delivery(),
        DestinationSpec::new(PROFILE_APP_NAME, PROFILE_ASPECT),
    ];
    let mut last_error = NodeError::Timeout;
    for spec in candidates {
        if Instant::now() >= deadline {
            break;
        }
        match fetch_via_candidate(node, &peer, &spec, request_path, body, deadline, kind).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) => {
                log::debug!(
                    "fetch candidate failed destination={} path={request_path} err={err}",
                    spec.full_name()
                );
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn fetch_via_candidate(
    node: &Arc<Node>,
    peer: &PeerIdentity,
    spec: &DestinationSpec,
    request_path: &str,
    body: &Value,
    deadline: Instant,
    kind: &str,
) -> Result<FetchOutcome, NodeError> {
    let transport = node.transport();
    let target = transport.destination_hash(peer, spec);
    if !transport.has_path(&target) {
        transport.request_path(&target);
        let path_deadline = deadline.min(Instant::now() + PATH_WAIT_CAP);
        loop {
            if transport.has_path(&target) {
                break;
            }
            if Instant::now() >= path_deadline {
                return Err(NodeError::NoPath);
            }
            tokio::time::sleep(PATH_POLL).await;
        }
    }

    // 1-buffered channels; the transport writes them with try_send so its
    // callback threads never block on us.
    let (event_tx, mut event_rx) = mpsc::channel(2);
    let link = transport.open_link(peer, spec, event_tx)?;
    match tokio::time::timeout_at(deadline, event_rx.recv()).await {
        Ok(Some(LinkEvent::Established)) => {}
        Ok(Some(LinkEvent::Closed)) | Ok(None) => return Err(NodeError::LinkClosed),
        Err(_) => {
            link.close();
            return Err(NodeError::Timeout);
        }
    }
    link.identify(node.identity());

    let (resource_tx, mut resource_rx) = mpsc::channel(1);
    link.accept_resources(resource_tx);
    let (reply_tx, mut reply_rx) = mpsc::channel(1);
    link.request(request_path, &wire::encode_value(body), reply_tx);

    let mut response_meta: Option<Value> = None;
    let outcome = loop {
        tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(RequestOutcome::Response(Value::Binary(bytes))) => {
                    // legacy peers answer with the bytes inline
                    break Ok(FetchOutcome::Bytes { bytes, metadata: response_meta });
                }
                Some(RequestOutcome::Response(value)) => {
                    if !wire::map_bool(&value, "ok").unwrap_or(false) {
                        break Err(match wire::map_string(&value, "error") {
                            Some(detail) if detail == "link not found" => NodeError::LinkNotFound,
                            Some(detail) => NodeError::RequestFailed(detail),
                            None => NodeError::NotFound,
                        });
                    }
                    if wire::map_bool(&value, "unchanged").unwrap_or(false) {
                        break Ok(FetchOutcome::Unchanged { metadata: value });
                    }
                    // metadata first, bytes still in flight on the resource
                    response_meta = Some(value);
                }
                Some(RequestOutcome::Failed(detail)) => {
                    break Err(NodeError::RequestFailed(detail));
                }
                None => break Err(NodeError::LinkClosed),
            },
            resource = resource_rx.recv() => match resource {
                Some(resource) => {
                    if !resource.ok {
                        break Err(NodeError::ResourceFailed("resource incomplete".to_string()));
                    }
                    if let Some(meta) = resource.metadata.as_ref() {
                        if let Some(got) = wire::map_string(meta, "kind") {
                            if got != kind {
                                break Err(NodeError::Protocol(format!(
                                    "unexpected resource kind {got}"
                                )));
                            }
                        }
                    }
                    let Some(file) = resource.backing_file.as_ref() else {
                        break Err(NodeError::ResourceFailed("resource without backing file".to_string()));
                    };
                    match std::fs::read(file) {
                        Ok(bytes) => break Ok(FetchOutcome::Bytes {
                            bytes,
                            metadata: resource.metadata.clone().or(response_meta),
                        }),
                        Err(err) => break Err(NodeError::Io(err)),
                    }
                }
                None => break Err(NodeError::LinkClosed),
            },
            _ = tokio::time::sleep_until(deadline) => break Err(NodeError::Timeout),
        }
    };
    link.close();
    outcome
}
