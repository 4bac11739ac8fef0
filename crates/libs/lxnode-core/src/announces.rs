//! In-memory registry of observed peer announces.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::transport::AnnounceObservation;
use crate::wire;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnnounceEntry {
    pub destination: String,
    pub display_name: Option<String>,
    pub last_seen: u64,
    pub app_data_len: usize,
}

/// Keyed by destination-hash hex; the most recent observation wins. The
/// registry itself is unbounded, callers cap what they present.
#[derive(Default)]
pub struct AnnounceRegistry {
    entries: Mutex<HashMap<String, AnnounceEntry>>,
}

impl AnnounceRegistry {
    pub fn record(&self, observation: &AnnounceObservation, now: u64) {
        let destination = hex::encode(observation.destination);
        let entry = AnnounceEntry {
            destination: destination.clone(),
            display_name: wire::display_name_from_app_data(&observation.app_data),
            last_seen: now,
            app_data_len: observation.app_data.len(),
        };
        self.entries.lock().expect("announce registry").insert(destination, entry);
    }

    /// Copy under the lock, sort outside it: newest first, destination hex
    /// as the tiebreak.
    pub fn snapshot(&self) -> Vec<AnnounceEntry> {
        let mut entries: Vec<AnnounceEntry> =
            self.entries.lock().expect("announce registry").values().cloned().collect();
        entries.sort_by(|a, b| {
            b.last_seen.cmp(&a.last_seen).then_with(|| a.destination.cmp(&b.destination))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("announce registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encode_announce_app_data;

    fn observation(seed: u8, name: &str) -> AnnounceObservation {
        AnnounceObservation {
            destination: [seed; 16],
            app_data: encode_announce_app_data(name, None, None),
        }
    }

    #[test]
    fn most_recent_write_wins() {
        let registry = AnnounceRegistry::default();
        registry.record(&observation(1, "old name"), 100);
        registry.record(&observation(1, "new name"), 200);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].display_name.as_deref(), Some("new name"));
        assert_eq!(snapshot[0].last_seen, 200);
    }

    #[test]
    fn snapshot_sorts_newest_first() {
        let registry = AnnounceRegistry::default();
        registry.record(&observation(1, "a"), 100);
        registry.record(&observation(2, "b"), 300);
        registry.record(&observation(3, "c"), 200);
        let names: Vec<_> =
            registry.snapshot().into_iter().filter_map(|entry| entry.display_name).collect();
        assert_eq!(names, ["b", "c", "a"]);
    }

    #[test]
    fn unparseable_app_data_keeps_the_entry() {
        let registry = AnnounceRegistry::default();
        let observation =
            AnnounceObservation { destination: [9; 16], app_data: vec![0xC1, 0xC1, 0xC1] };
        registry.record(&observation, 50);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].display_name, None);
        assert_eq!(snapshot[0].app_data_len, 3);
    }
}
