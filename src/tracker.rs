//! Counter-threshold confirmation.
//!
//! Each camera keeps a sighting count per plate. A plate is confirmed on the
//! sighting where its count equals the threshold, so a vehicle lingering in view
//! confirms once. The periodic sweep evicts plates not seen within the reset
//! window, which lets a later visit start a fresh episode at count 1.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::plate::PlateText;

pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackerEntry {
    pub count: u32,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct DetectionTracker {
    threshold: u32,
    reset_window: Duration,
    cameras: HashMap<String, HashMap<PlateText, TrackerEntry>>,
}

impl DetectionTracker {
    pub fn new(threshold: u32, reset_window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_window,
            cameras: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a sighting and return the plate's count for this camera.
    pub fn observe(&mut self, camera_id: &str, plate: &PlateText, now: Instant) -> u32 {
        let plates = self.cameras.entry(camera_id.to_string()).or_default();
        let entry = plates
            .entry(plate.clone())
            .and_modify(|entry| entry.count = entry.count.saturating_add(1))
            .or_insert(TrackerEntry {
                count: 1,
                last_seen: now,
            });
        entry.last_seen = now;
        entry.count
    }

    /// True exactly on the confirming sighting.
    pub fn is_confirmation(&self, count: u32) -> bool {
        count == self.threshold
    }

    pub fn entry(&self, camera_id: &str, plate: &PlateText) -> Option<&TrackerEntry> {
        self.cameras.get(camera_id)?.get(plate)
    }

    /// Remove entries last seen more than the reset window before `now`.
    /// Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.reset_window;
        let mut removed = 0;
        for (camera_id, plates) in self.cameras.iter_mut() {
            plates.retain(|plate, entry| {
                let stale = now.saturating_duration_since(entry.last_seen) > window;
                if stale {
                    log::debug!(
                        "DetectionTracker: evicting {} on {} (count {})",
                        plate,
                        camera_id,
                        entry.count
                    );
                    removed += 1;
                }
                !stale
            });
        }
        self.cameras.retain(|_, plates| !plates.is_empty());
        removed
    }

    /// Total tracked plates across cameras.
    pub fn len(&self) -> usize {
        self.cameras.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

impl Default for DetectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_RESET_WINDOW)
    }
}
