//! Awareness: who is online right now.
//!
//! Presence is ephemeral by design. It never flows through the CRDT merge
//! path and is never persisted — there is no history, only the current
//! value, decayed when the transport reports a peer's link closed.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tally_core::model::id::DeviceId;

/// A device's self-reported display identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    /// The broadcasting device.
    pub device: DeviceId,
    /// Display name chosen on that device.
    pub name: String,
    /// Display color (any CSS-ish string; opaque to the engine).
    pub color: String,
}

/// A presence entry with the time it was last refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    /// The peer's display identity.
    pub state: PresenceState,
    /// When it was last seen, microseconds since Unix epoch.
    pub last_seen_us: i64,
}

/// Map from peer device to last-known presence.
#[derive(Debug, Default)]
pub struct PresenceMap {
    inner: Mutex<BTreeMap<DeviceId, PresenceEntry>>,
}

impl PresenceMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a peer's presence.
    pub fn update(&self, state: PresenceState, now_us: i64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.insert(
            state.device.clone(),
            PresenceEntry {
                state,
                last_seen_us: now_us,
            },
        );
    }

    /// Drop a peer whose link closed.
    pub fn remove(&self, device: &DeviceId) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.remove(device);
    }

    /// Whether a peer is currently present.
    #[must_use]
    pub fn contains(&self, device: &DeviceId) -> bool {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.contains_key(device)
    }

    /// Snapshot of all current entries, in device order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(code: &str, name: &str) -> PresenceState {
        PresenceState {
            device: DeviceId::new_unchecked(code),
            name: name.to_string(),
            color: "#aa66cc".to_string(),
        }
    }

    #[test]
    fn update_then_remove_decays_entry() {
        let map = PresenceMap::new();
        let device = DeviceId::new_unchecked("A2B3C4");
        map.update(state("A2B3C4", "kitchen phone"), 100);
        assert!(map.contains(&device));

        map.remove(&device);
        assert!(!map.contains(&device));
        assert!(map.snapshot().is_empty());
    }

    #[test]
    fn refresh_replaces_not_duplicates() {
        let map = PresenceMap::new();
        map.update(state("A2B3C4", "old name"), 100);
        map.update(state("A2B3C4", "new name"), 200);

        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].state.name, "new name");
        assert_eq!(snapshot[0].last_seen_us, 200);
    }
}
