//! Delivery-destination announce engine.
//!
//! Announces are gated on interface readiness instead of being sent
//! optimistically: emitting while nothing is online makes the transport log
//! "no usable interfaces" on every attempt, which drowns mobile logs during
//! suspend/resume cycles. Concurrency is a single atomic in-flight gate plus
//! one coalesced follow-up; a mutex held across the whole attempt would park
//! callers for the full readiness deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::InterfaceConfig;
use crate::error::NodeError;
use crate::node::Node;
use crate::transport::InterfaceStatus;

pub(crate) const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
const READY_POLL: Duration = Duration::from_millis(500);
const READY_SETTLE: Duration = Duration::from_secs(1);
const PREFER_TCP_WINDOW: Duration = Duration::from_secs(6);
const READY_DEADLINE: Duration = Duration::from_secs(20);

pub(crate) const REASON_QUEUED: &str = "queued";
pub(crate) const REASON_RESUME: &str = "resume";
pub(crate) const REASON_PERIODIC: &str = "periodic";

/// Single-flight gate: at most one attempt in flight, at most one deferred.
#[derive(Default)]
pub(crate) struct AnnounceGate {
    in_flight: AtomicBool,
    queued: AtomicBool,
}

impl AnnounceGate {
    /// Claim the gate. A losing caller leaves exactly one follow-up behind.
    pub(crate) fn try_begin(&self) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
        self.queued.store(true, Ordering::Release);
        false
    }

    /// Release the gate; true when a coalesced follow-up must fire.
    pub(crate) fn finish(&self) -> bool {
        self.in_flight.store(false, Ordering::Release);
        self.queued.swap(false, Ordering::AcqRel)
    }
}

/// Drive announce attempts until the gate drains. The loop shape keeps the
/// invariant without recursion: each follow-up re-claims the gate, so a
/// concurrent caller that slips in between simply wins it instead.
pub(crate) async fn run_announce(node: Arc<Node>, reason: String) {
    let mut reason = reason;
    loop {
        if !node.announce_gate().try_begin() {
            log::debug!("announce coalesced reason={reason}");
            return;
        }
        match attempt(&node, &reason).await {
            Ok(()) => {}
            Err(err) => log::warn!("announce attempt failed reason={reason} err={err}"),
        }
        if !node.announce_gate().finish() {
            return;
        }
        reason = REASON_QUEUED.to_string();
    }
}

async fn attempt(node: &Arc<Node>, reason: &str) -> Result<(), NodeError> {
    if reason == REASON_RESUME {
        node.reset_enabled_interfaces().await;
    }

    let started = Instant::now();
    let prefer_deadline = started + PREFER_TCP_WINDOW;
    let hard_deadline = started + READY_DEADLINE;
    loop {
        let enabled = enabled_interfaces(node);
        let stats = node.transport().interface_stats();
        let accept_non_tcp = Instant::now() >= prefer_deadline;
        if announce_ready(&enabled, &stats, accept_non_tcp) {
            // TCP clients flap right after connecting; confirm readiness
            // survives a settle interval before emitting.
            tokio::time::sleep(READY_SETTLE).await;
            let stats = node.transport().interface_stats();
            let accept_non_tcp = Instant::now() >= prefer_deadline;
            if announce_ready(&enabled, &stats, accept_non_tcp) {
                break;
            }
        }
        if Instant::now() >= hard_deadline {
            log::warn!(
                "announce skipped reason={} {}",
                reason,
                readiness_diagnostics(&enabled, &stats)
            );
            return Err(NodeError::Timeout);
        }
        tokio::time::sleep(READY_POLL).await;
    }

    let app_data = node.compose_announce_app_data();
    node.delivery_destination().announce(&app_data)?;
    log::info!("announce sent reason={} app_data_len={}", reason, app_data.len());
    Ok(())
}

fn enabled_interfaces(node: &Node) -> Vec<InterfaceConfig> {
    node.configured_interfaces().into_iter().filter(|iface| iface.enabled).collect()
}

/// Runtime stats key by short name or full name.
pub(crate) fn interface_online(iface: &InterfaceConfig, stats: &[InterfaceStatus]) -> bool {
    stats.iter().any(|status| {
        status.online
            && (status.name == iface.name
                || status.short_name.as_deref() == Some(iface.name.as_str()))
    })
}

/// Readiness for announcing. With no enabled sections configured any online
/// runtime interface counts; otherwise at least one enabled section must be
/// online, and while the TCP preference window is open an enabled TCP
/// interface must be among them.
pub(crate) fn announce_ready(
    enabled: &[InterfaceConfig],
    stats: &[InterfaceStatus],
    accept_non_tcp: bool,
) -> bool {
    if enabled.is_empty() {
        return stats.iter().any(|status| status.online);
    }
    if !enabled.iter().any(|iface| interface_online(iface, stats)) {
        return false;
    }
    if !accept_non_tcp {
        let tcp: Vec<&InterfaceConfig> = enabled.iter().filter(|iface| iface.is_tcp()).collect();
        if !tcp.is_empty() && !tcp.iter().any(|iface| interface_online(iface, stats)) {
            return false;
        }
    }
    true
}

fn readiness_diagnostics(enabled: &[InterfaceConfig], stats: &[InterfaceStatus]) -> String {
    let enabled_names: Vec<&str> = enabled.iter().map(|iface| iface.name.as_str()).collect();
    let (online, offline): (Vec<&InterfaceStatus>, Vec<&InterfaceStatus>) =
        stats.iter().partition(|status| status.online);
    let online: Vec<&str> = online.iter().map(|status| status.name.as_str()).collect();
    let offline: Vec<&str> = offline.iter().map(|status| status.name.as_str()).collect();
    format!("enabled={enabled_names:?} online={online:?} offline={offline:?}")
}

/// Re-announce every minute until the stop channel closes the loop.
pub(crate) async fn periodic_announcer(node: Arc<Node>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {
                tokio::spawn(run_announce(node.clone(), REASON_PERIODIC.to_string()));
            }
            _ = stop.changed() => return,
        }
    }
}
