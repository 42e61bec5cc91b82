//! Confirmation policies.
//!
//! Per-frame plate readings are noisy. A `ConfirmationPolicy` decides when a
//! sequence of readings is a real vehicle that should move the gate. Two
//! interchangeable policies exist, selected at composition time:
//!
//! - `counter`: `DetectionTracker`, confirm on the T-th sighting, then the
//!   whitelist API decides (fail-closed)
//! - `quorum`: `AuthorizationStateMachine` over the allow-list, grant on quorum
//!   within the recognition window

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::auth::{AllowList, AuthEvent, AuthSettings, AuthorizationStateMachine};
use crate::plate::PlateText;
use crate::tracker::{DetectionTracker, DEFAULT_RESET_WINDOW, DEFAULT_THRESHOLD};

/// Outcome of feeding one sighting to a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Not confirmed on this sighting.
    Pending,
    /// Confirmed by repetition. Authorisation still has to be checked.
    Confirmed(PlateText),
    /// Confirmed and already matched against the allow-list.
    Granted(PlateText),
}

pub trait ConfirmationPolicy: Send {
    fn name(&self) -> &'static str;

    /// False while detection should be suppressed for this lane.
    fn accepting(&self) -> bool {
        true
    }

    /// Feed one in-ROI, non-empty plate reading.
    fn observe(
        &mut self,
        camera_id: &str,
        plate: &PlateText,
        allow_list: &AllowList,
        now: Instant,
    ) -> Verdict;

    /// Per-cycle timeout evaluation.
    fn tick(&mut self, _now: Instant) {}

    /// Periodic cleanup. Returns evicted entries.
    fn sweep(&mut self, _now: Instant) -> usize {
        0
    }

    /// Whether this policy matches against the local allow-list.
    fn uses_allow_list(&self) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Counter threshold
// ----------------------------------------------------------------------------

pub struct CounterThresholdPolicy {
    tracker: DetectionTracker,
}

impl CounterThresholdPolicy {
    pub fn new(threshold: u32, reset_window: Duration) -> Self {
        Self {
            tracker: DetectionTracker::new(threshold, reset_window),
        }
    }

    pub fn tracker(&self) -> &DetectionTracker {
        &self.tracker
    }
}

impl ConfirmationPolicy for CounterThresholdPolicy {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn observe(
        &mut self,
        camera_id: &str,
        plate: &PlateText,
        _allow_list: &AllowList,
        now: Instant,
    ) -> Verdict {
        let count = self.tracker.observe(camera_id, plate, now);
        log::info!(
            "{}: {} seen {}/{}",
            camera_id,
            plate,
            count,
            self.tracker.threshold()
        );
        if self.tracker.is_confirmation(count) {
            Verdict::Confirmed(plate.clone())
        } else {
            Verdict::Pending
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        self.tracker.sweep(now)
    }
}

// ----------------------------------------------------------------------------
// Quorum state machine
// ----------------------------------------------------------------------------

pub struct QuorumPolicy {
    machine: AuthorizationStateMachine,
}

impl QuorumPolicy {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            machine: AuthorizationStateMachine::new(settings),
        }
    }

    pub fn machine(&self) -> &AuthorizationStateMachine {
        &self.machine
    }
}

impl ConfirmationPolicy for QuorumPolicy {
    fn name(&self) -> &'static str {
        "quorum"
    }

    fn accepting(&self) -> bool {
        self.machine.accepting()
    }

    fn observe(
        &mut self,
        camera_id: &str,
        plate: &PlateText,
        allow_list: &AllowList,
        now: Instant,
    ) -> Verdict {
        match self.machine.on_recognized(plate, allow_list, now) {
            AuthEvent::Granted(allowed) => Verdict::Granted(allowed),
            AuthEvent::Counting { plate: allowed, count } => {
                log::info!("{}: {} matched {} ({})", camera_id, plate, allowed, count);
                Verdict::Pending
            }
            AuthEvent::NotAllowed => {
                log::info!("{}: {} is not on the allow-list", camera_id, plate);
                Verdict::Pending
            }
            AuthEvent::Suppressed => Verdict::Pending,
        }
    }

    fn tick(&mut self, now: Instant) {
        self.machine.tick(now);
    }

    fn uses_allow_list(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Selection
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Counter,
    Quorum,
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "counter" => Ok(PolicyKind::Counter),
            "quorum" => Ok(PolicyKind::Quorum),
            other => Err(anyhow!(
                "unknown confirmation policy '{}'; expected counter or quorum",
                other
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicySettings {
    pub kind: PolicyKind,
    pub threshold: u32,
    pub reset_window: Duration,
    pub auth: AuthSettings,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Counter,
            threshold: DEFAULT_THRESHOLD,
            reset_window: DEFAULT_RESET_WINDOW,
            auth: AuthSettings::default(),
        }
    }
}

impl PolicySettings {
    /// A fresh policy instance; each camera lane owns one.
    pub fn build(&self) -> Box<dyn ConfirmationPolicy> {
        match self.kind {
            PolicyKind::Counter => Box::new(CounterThresholdPolicy::new(
                self.threshold,
                self.reset_window,
            )),
            PolicyKind::Quorum => Box::new(QuorumPolicy::new(self.auth.clone())),
        }
    }
}
