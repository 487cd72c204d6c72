//! SIM lock bookkeeping.

use derive_more::Display;
use std::collections::HashMap;

/// Reported when the retries-by-type map has no entry for the current lock:
/// unknown, assume plenty.
pub const UNKNOWN_RETRIES_LEFT: u32 = 999;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SimLockType {
    #[default]
    Unknown,
    None,
    SimPin,
    SimPuk,
}

impl SimLockType {
    pub fn is_locked(self) -> bool {
        matches!(self, SimLockType::SimPin | SimLockType::SimPuk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimLockStatus {
    pub enabled: bool,
    pub lock_type: SimLockType,
    pub retries_left: u32,
}

/// Tracks the SIM's PIN/PUK lock and remaining unlock retries from
/// lock-type and retry notifications. The owner raises the host's
/// "lock status changed" notification whenever a feed method reports a
/// change, and refreshes SIM identity properties once [`unlocked`] flips
/// true, since the SIM is only readable without a lock in force.
///
/// [`unlocked`]: SimLockTracker::unlocked
#[derive(Debug, Default)]
pub struct SimLockTracker {
    status: SimLockStatus,
    retries_by_type: HashMap<SimLockType, u32>,
}

impl SimLockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> SimLockStatus {
        self.status
    }

    /// No lock in force; SIM identity is readable.
    pub fn unlocked(&self) -> bool {
        matches!(
            self.status.lock_type,
            SimLockType::None | SimLockType::Unknown
        )
    }

    /// Returns true when the visible status changed.
    pub fn on_lock_type_changed(&mut self, lock_type: SimLockType) -> bool {
        let before = self.status;
        self.status.lock_type = lock_type;

        // A locked SIM keeps the facility-lock property unreadable, so
        // `enabled` may still be false here; a lock in force implies it.
        if lock_type.is_locked() {
            self.status.enabled = true;
        }
        self.refresh_retries();

        self.status != before
    }

    /// Returns true when the visible status changed.
    pub fn on_lock_retries_changed(&mut self, retries: HashMap<SimLockType, u32>) -> bool {
        let before = self.status;
        self.retries_by_type = retries;
        self.refresh_retries();
        self.status != before
    }

    /// Facility-lock toggle from the network interface ("is PIN protection
    /// switched on"), independent of whether a lock is currently in force.
    pub fn on_pin_enabled_changed(&mut self, enabled: bool) -> bool {
        let before = self.status.enabled;
        self.status.enabled = enabled;
        self.status.enabled != before
    }

    fn refresh_retries(&mut self) {
        self.status.retries_left = self
            .retries_by_type
            .get(&self.status.lock_type)
            .copied()
            .unwrap_or(UNKNOWN_RETRIES_LEFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_follow_the_current_lock_type() {
        let mut tracker = SimLockTracker::new();
        tracker.on_lock_type_changed(SimLockType::SimPin);

        let changed = tracker
            .on_lock_retries_changed(HashMap::from([(SimLockType::SimPin, 3)]));

        assert!(changed);
        assert_eq!(tracker.status().retries_left, 3);
    }

    #[test]
    fn missing_retry_entry_reads_as_999() {
        let mut tracker = SimLockTracker::new();
        tracker.on_lock_retries_changed(HashMap::from([(SimLockType::SimPin, 3)]));

        tracker.on_lock_type_changed(SimLockType::SimPuk);

        assert_eq!(tracker.status().retries_left, UNKNOWN_RETRIES_LEFT);
    }

    #[test]
    fn a_lock_in_force_implies_enabled() {
        let mut tracker = SimLockTracker::new();
        assert!(!tracker.status().enabled);

        tracker.on_lock_type_changed(SimLockType::SimPin);

        assert!(tracker.status().enabled);
        assert!(!tracker.unlocked());
    }

    #[test]
    fn unlocking_is_visible_and_reported_as_a_change() {
        let mut tracker = SimLockTracker::new();
        tracker.on_lock_type_changed(SimLockType::SimPin);

        let changed = tracker.on_lock_type_changed(SimLockType::None);

        assert!(changed);
        assert!(tracker.unlocked());
        // `enabled` reflects the facility toggle, not the momentary lock.
        assert!(tracker.status().enabled);
    }

    #[test]
    fn unchanged_updates_are_not_reported() {
        let mut tracker = SimLockTracker::new();
        tracker.on_lock_type_changed(SimLockType::SimPin);
        tracker.on_lock_retries_changed(HashMap::from([(SimLockType::SimPin, 3)]));

        let changed = tracker
            .on_lock_retries_changed(HashMap::from([(SimLockType::SimPin, 3)]));

        assert!(!changed);
    }
}
