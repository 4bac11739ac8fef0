//! Interface watchdog and reset controller.
//!
//! Mobile platforms freeze sockets across suspend; after resume they look
//! connected but carry nothing. The watchdog observes the runtime status of
//! every enabled interface and, once all of them have been offline long
//! enough, halts and resumes them so the OS re-establishes real sockets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::announce::interface_online;
use crate::config::InterfaceConfig;
use crate::transport::{InterfaceStatus, MeshTransport};

pub(crate) const WATCHDOG_TICK: Duration = Duration::from_secs(2);
const OFFLINE_RESET_THRESHOLD: Duration = Duration::from_secs(6);
const RESET_BACKOFF: Duration = Duration::from_secs(12);
const RESET_SETTLE: Duration = Duration::from_millis(400);

pub(crate) struct InterfaceController {
    offline_since: Mutex<HashMap<String, Instant>>,
    last_reset: Mutex<Option<Instant>>,
    /// Serialises the entire halt + settle + resume block.
    reset_lock: tokio::sync::Mutex<()>,
}

impl InterfaceController {
    pub(crate) fn new() -> Self {
        Self {
            offline_since: Mutex::new(HashMap::new()),
            last_reset: Mutex::new(None),
            reset_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Fold one watchdog observation into the offline bookkeeping. Returns
    /// true when a hard reset is due: every enabled interface offline, the
    /// longest outage at least the threshold, and the previous reset far
    /// enough in the past.
    pub(crate) fn observe(
        &self,
        now: Instant,
        enabled: &[InterfaceConfig],
        stats: &[InterfaceStatus],
    ) -> bool {
        let mut offline = self.offline_since.lock().expect("offline map");
        let mut any_online = false;
        let mut longest_offline = Duration::ZERO;
        for iface in enabled {
            if interface_online(iface, stats) {
                offline.remove(&iface.name);
                any_online = true;
            } else {
                let since = *offline.entry(iface.name.clone()).or_insert(now);
                longest_offline = longest_offline.max(now.saturating_duration_since(since));
            }
        }
        offline.retain(|name, _| enabled.iter().any(|iface| &iface.name == name));

        if enabled.is_empty() || any_online || longest_offline < OFFLINE_RESET_THRESHOLD {
            return false;
        }
        let last_reset = self.last_reset.lock().expect("last reset");
        match *last_reset {
            Some(last) => now.saturating_duration_since(last) >= RESET_BACKOFF,
            None => true,
        }
    }

    /// Halt every enabled interface in order, give the OS a moment to
    /// release the sockets, then resume them in the same order. Failures on
    /// individual interfaces are logged and skipped.
    pub(crate) async fn reset_enabled(
        &self,
        transport: &dyn MeshTransport,
        enabled: &[InterfaceConfig],
    ) {
        let _guard = self.reset_lock.lock().await;
        let names: Vec<&str> = enabled.iter().map(|iface| iface.name.as_str()).collect();
        log::info!("interface reset begin interfaces={names:?}");
        for name in &names {
            if let Err(err) = transport.halt_interface(name) {
                log::warn!("interface halt failed name={name} err={err}");
            }
        }
        tokio::time::sleep(RESET_SETTLE).await;
        for name in &names {
            if let Err(err) = transport.resume_interface(name) {
                log::warn!("interface resume failed name={name} err={err}");
            }
        }
        *self.last_reset.lock().expect("last reset") = Some(Instant::now());
        log::info!("interface reset done interfaces={names:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str) -> InterfaceConfig {
        InterfaceConfig { name: name.to_string(), kind: "AutoInterface".to_string(), enabled: true }
    }

    fn status(name: &str, online: bool) -> InterfaceStatus {
        InterfaceStatus { name: name.to_string(), short_name: None, online }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_waits_for_sustained_outage() {
        let controller = InterfaceController::new();
        let enabled = [iface("Default")];
        let t0 = Instant::now();
        assert!(!controller.observe(t0, &enabled, &[status("Default", false)]));
        assert!(!controller.observe(
            t0 + Duration::from_secs(4),
            &enabled,
            &[status("Default", false)]
        ));
        assert!(controller.observe(
            t0 + Duration::from_secs(7),
            &enabled,
            &[status("Default", false)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn any_online_interface_clears_the_outage() {
        let controller = InterfaceController::new();
        let enabled = [iface("A"), iface("B")];
        let t0 = Instant::now();
        let offline = [status("A", false), status("B", false)];
        assert!(!controller.observe(t0, &enabled, &offline));
        // B comes back before the threshold, then drops again: the clock
        // restarts for it but A's outage keeps accruing.
        assert!(!controller.observe(
            t0 + Duration::from_secs(3),
            &enabled,
            &[status("A", false), status("B", true)]
        ));
        assert!(!controller.observe(t0 + Duration::from_secs(4), &enabled, &offline));
        assert!(controller.observe(t0 + Duration::from_secs(10), &enabled, &offline));
    }

    #[tokio::test(start_paused = true)]
    async fn no_enabled_interfaces_never_resets() {
        let controller = InterfaceController::new();
        let t0 = Instant::now();
        assert!(!controller.observe(t0, &[], &[status("X", false)]));
        assert!(!controller.observe(t0 + Duration::from_secs(60), &[], &[]));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_blocks_resets_for_twelve_seconds() {
        let controller = InterfaceController::new();
        let enabled = [iface("Default")];
        let offline = [status("Default", false)];
        let t0 = Instant::now();
        assert!(!controller.observe(t0, &enabled, &offline));
        assert!(controller.observe(t0 + Duration::from_secs(8), &enabled, &offline));
        *controller.last_reset.lock().expect("last reset") = Some(t0 + Duration::from_secs(8));
        assert!(!controller.observe(t0 + Duration::from_secs(14), &enabled, &offline));
        assert!(controller.observe(t0 + Duration::from_secs(21), &enabled, &offline));
    }
}
