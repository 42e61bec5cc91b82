//! Quorum/timeout authorisation.
//!
//! `AllowList` decides whether recognised text names an allowed plate, tolerating
//! one OCR slip. `AuthorizationStateMachine` turns a stream of such matches into
//! a single grant:
//!
//! ```text
//! Idle --match--> Recognizing --quorum reached--> AccessGranted
//!  ^                  |                                |
//!  +-- recognition ---+                                |
//!  |   timeout                                         |
//!  +------------------- access timeout ----------------+
//! ```
//!
//! While access is granted no further matching is performed. All transitions are
//! driven by the caller's `now`, so the machine is deterministic under test.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::plate::PlateText;

pub const DEFAULT_REQUIRED_QUORUM: u32 = 3;
pub const DEFAULT_RECOGNITION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ACCESS_TIMEOUT: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Allow-list
// ----------------------------------------------------------------------------

/// Allowed plates: static entries from configuration plus the last successful
/// whitelist fetch.
#[derive(Clone, Debug, Default)]
pub struct AllowList {
    configured: BTreeSet<PlateText>,
    fetched: BTreeSet<PlateText>,
}

impl AllowList {
    pub fn new<I: IntoIterator<Item = PlateText>>(configured: I) -> Self {
        Self {
            configured: configured.into_iter().collect(),
            fetched: BTreeSet::new(),
        }
    }

    /// Replace the fetched entries with a fresh whitelist.
    pub fn replace_fetched<I: IntoIterator<Item = PlateText>>(&mut self, plates: I) {
        self.fetched = plates.into_iter().collect();
    }

    /// Drop fetched entries after a failed refresh. Configured entries remain.
    pub fn clear_fetched(&mut self) {
        self.fetched.clear();
    }

    pub fn len(&self) -> usize {
        self.configured.union(&self.fetched).count()
    }

    pub fn is_empty(&self) -> bool {
        self.configured.is_empty() && self.fetched.is_empty()
    }

    fn entries(&self) -> impl Iterator<Item = &PlateText> {
        self.configured.union(&self.fetched)
    }

    /// The allowed plate `recognized` matches, if any.
    ///
    /// An allowed plate matches when it appears verbatim inside the recognised
    /// text, or when the two differ by one inserted, deleted, or substituted
    /// character.
    pub fn matches(&self, recognized: &PlateText) -> Option<PlateText> {
        if let Some(plate) = self
            .entries()
            .find(|allowed| recognized.as_str().contains(allowed.as_str()))
        {
            return Some(plate.clone());
        }
        self.entries()
            .find(|allowed| within_one_edit(recognized.as_str(), allowed.as_str()))
            .cloned()
    }
}

/// True when the Levenshtein distance between `a` and `b` is at most 1.
pub fn within_one_edit(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if long.len() - short.len() > 1 {
        return false;
    }
    let prefix = short
        .iter()
        .zip(long.iter())
        .take_while(|(x, y)| x == y)
        .count();
    if prefix == short.len() {
        return true;
    }
    if short.len() == long.len() {
        // One substitution at `prefix`.
        short[prefix + 1..] == long[prefix + 1..]
    } else {
        // One insertion into `short` at `prefix`.
        short[prefix..] == long[prefix + 1..]
    }
}

// ----------------------------------------------------------------------------
// State machine
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    Recognizing,
    AccessGranted,
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub required_quorum: u32,
    pub recognition_timeout: Duration,
    pub access_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            required_quorum: DEFAULT_REQUIRED_QUORUM,
            recognition_timeout: DEFAULT_RECOGNITION_TIMEOUT,
            access_timeout: DEFAULT_ACCESS_TIMEOUT,
        }
    }
}

/// What one recognised plate did to the machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    /// Access is currently granted; matching is suppressed.
    Suppressed,
    /// The text matched no allowed plate.
    NotAllowed,
    /// Counted towards quorum.
    Counting { plate: PlateText, count: u32 },
    /// Quorum reached; the machine is now in `AccessGranted`.
    Granted(PlateText),
}

#[derive(Debug)]
pub struct AuthorizationStateMachine {
    settings: AuthSettings,
    phase: AuthPhase,
    match_counts: HashMap<PlateText, u32>,
    phase_start: Option<Instant>,
    granted_plate: Option<PlateText>,
}

impl AuthorizationStateMachine {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            settings,
            phase: AuthPhase::Idle,
            match_counts: HashMap::new(),
            phase_start: None,
            granted_plate: None,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn granted_plate(&self) -> Option<&PlateText> {
        self.granted_plate.as_ref()
    }

    pub fn match_count(&self, plate: &PlateText) -> u32 {
        self.match_counts.get(plate).copied().unwrap_or(0)
    }

    /// False while access is granted.
    pub fn accepting(&self) -> bool {
        self.phase != AuthPhase::AccessGranted
    }

    /// Apply timeouts. Returns the new phase when a transition happened.
    pub fn tick(&mut self, now: Instant) -> Option<AuthPhase> {
        let start = self.phase_start?;
        let elapsed = now.saturating_duration_since(start);
        match self.phase {
            AuthPhase::Recognizing if elapsed > self.settings.recognition_timeout => {
                log::info!(
                    "AuthorizationStateMachine: recognition timed out after {:?} without quorum",
                    elapsed
                );
                self.reset();
                Some(AuthPhase::Idle)
            }
            AuthPhase::AccessGranted if elapsed > self.settings.access_timeout => {
                log::info!(
                    "AuthorizationStateMachine: access window for {} closed",
                    self.granted_plate
                        .as_ref()
                        .map(PlateText::as_str)
                        .unwrap_or("?")
                );
                self.reset();
                Some(AuthPhase::Idle)
            }
            _ => None,
        }
    }

    /// Feed one recognised plate.
    pub fn on_recognized(
        &mut self,
        recognized: &PlateText,
        allow_list: &AllowList,
        now: Instant,
    ) -> AuthEvent {
        self.tick(now);
        if !self.accepting() {
            return AuthEvent::Suppressed;
        }
        match allow_list.matches(recognized) {
            Some(plate) => self.record_match(plate, now),
            None => AuthEvent::NotAllowed,
        }
    }

    /// Count a match against an allowed plate. Timeouts are applied first, so an
    /// expired recognition window starts a new episode.
    pub fn record_match(&mut self, plate: PlateText, now: Instant) -> AuthEvent {
        self.tick(now);
        match self.phase {
            AuthPhase::AccessGranted => return AuthEvent::Suppressed,
            AuthPhase::Idle => {
                self.phase = AuthPhase::Recognizing;
                self.phase_start = Some(now);
                self.match_counts.clear();
            }
            AuthPhase::Recognizing => {}
        }
        let count = {
            let count = self.match_counts.entry(plate.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.settings.required_quorum.max(1) {
            log::info!(
                "AuthorizationStateMachine: access granted for {} ({} matches)",
                plate,
                count
            );
            self.phase = AuthPhase::AccessGranted;
            self.phase_start = Some(now);
            self.match_counts.clear();
            self.granted_plate = Some(plate.clone());
            return AuthEvent::Granted(plate);
        }
        log::debug!(
            "AuthorizationStateMachine: {} matched {}/{}",
            plate,
            count,
            self.settings.required_quorum
        );
        AuthEvent::Counting { plate, count }
    }

    fn reset(&mut self) {
        self.phase = AuthPhase::Idle;
        self.phase_start = None;
        self.match_counts.clear();
        self.granted_plate = None;
    }
}

impl Default for AuthorizationStateMachine {
    fn default() -> Self {
        Self::new(AuthSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate(text: &str) -> PlateText {
        PlateText::normalize(text).unwrap()
    }

    fn allow(plates: &[&str]) -> AllowList {
        AllowList::new(plates.iter().map(|p| plate(p)))
    }

    #[test]
    fn one_edit_is_accepted_two_are_rejected() {
        let list = allow(&["EL106AC"]);
        // substitution, insertion, deletion
        assert_eq!(list.matches(&plate("EL1O6AC")), Some(plate("EL106AC")));
        assert_eq!(list.matches(&plate("EL1066AC")), Some(plate("EL106AC")));
        assert_eq!(list.matches(&plate("EL16AC")), Some(plate("EL106AC")));
        // two substitutions
        assert_eq!(list.matches(&plate("FL1O6AC")), None);
        assert_eq!(list.matches(&plate("EL1")), None);
    }

    #[test]
    fn containment_matches_surrounding_noise() {
        let list = allow(&["B2228HM"]);
        assert_eq!(list.matches(&plate("CZB2228HMX")), Some(plate("B2228HM")));
    }

    #[test]
    fn edit_distance_edges() {
        assert!(within_one_edit("", ""));
        assert!(within_one_edit("", "A"));
        assert!(within_one_edit("ABC", "ABD"));
        assert!(within_one_edit("ABC", "XABC"));
        assert!(!within_one_edit("ABC", "CBA"));
        assert!(!within_one_edit("ABCD", "AB"));
    }

    #[test]
    fn failed_refresh_keeps_configured_entries() {
        let mut list = allow(&["8AN4277"]);
        list.replace_fetched(vec![plate("BLBECEK")]);
        assert_eq!(list.len(), 2);
        assert!(list.matches(&plate("BLBECEK")).is_some());

        list.clear_fetched();
        assert!(list.matches(&plate("BLBECEK")).is_none());
        assert!(list.matches(&plate("8AN4277")).is_some());
    }

    #[test]
    fn quorum_within_timeout_grants_access() {
        let list = allow(&["AB1234C"]);
        let mut machine = AuthorizationStateMachine::default();
        let t0 = Instant::now();
        let p = plate("AB1234C");

        assert_eq!(
            machine.on_recognized(&p, &list, t0),
            AuthEvent::Counting {
                plate: p.clone(),
                count: 1
            }
        );
        assert_eq!(machine.phase(), AuthPhase::Recognizing);
        machine.on_recognized(&p, &list, t0 + Duration::from_secs(1));
        assert_eq!(
            machine.on_recognized(&p, &list, t0 + Duration::from_secs(2)),
            AuthEvent::Granted(p.clone())
        );
        assert_eq!(machine.phase(), AuthPhase::AccessGranted);
        assert_eq!(machine.granted_plate(), Some(&p));
        assert_eq!(machine.match_count(&p), 0);
    }

    #[test]
    fn recognition_timeout_returns_to_idle() {
        let list = allow(&["AB1234C"]);
        let mut machine = AuthorizationStateMachine::default();
        let t0 = Instant::now();
        let p = plate("AB1234C");

        machine.on_recognized(&p, &list, t0);
        machine.on_recognized(&p, &list, t0 + Duration::from_secs(1));
        assert_eq!(machine.match_count(&p), 2);

        assert_eq!(
            machine.tick(t0 + Duration::from_secs(6)),
            Some(AuthPhase::Idle)
        );
        assert_eq!(machine.phase(), AuthPhase::Idle);
        assert_eq!(machine.match_count(&p), 0);
    }

    #[test]
    fn timeouts_are_strict() {
        let mut machine = AuthorizationStateMachine::default();
        let t0 = Instant::now();
        let p = plate("AB1234C");
        machine.record_match(p, t0);
        assert_eq!(machine.tick(t0 + DEFAULT_RECOGNITION_TIMEOUT), None);
        assert_eq!(machine.phase(), AuthPhase::Recognizing);
    }

    #[test]
    fn late_match_starts_a_new_episode() {
        let mut machine = AuthorizationStateMachine::default();
        let t0 = Instant::now();
        let p = plate("AB1234C");

        machine.record_match(p.clone(), t0);
        machine.record_match(p.clone(), t0 + Duration::from_secs(1));
        assert_eq!(machine.match_count(&p), 2);

        // No tick in between: the expired window must not absorb this match.
        assert_eq!(
            machine.record_match(p.clone(), t0 + Duration::from_secs(7)),
            AuthEvent::Counting { plate: p.clone(), count: 1 }
        );
        assert_eq!(machine.phase(), AuthPhase::Recognizing);
        // The new window runs from the late match.
        assert_eq!(machine.tick(t0 + Duration::from_secs(11)), None);
        assert_eq!(
            machine.tick(t0 + Duration::from_secs(13)),
            Some(AuthPhase::Idle)
        );
    }

    #[test]
    fn access_granted_suppresses_matching_until_timeout() {
        let list = allow(&["AB1234C"]);
        let mut machine = AuthorizationStateMachine::new(AuthSettings {
            required_quorum: 1,
            ..AuthSettings::default()
        });
        let t0 = Instant::now();
        let p = plate("AB1234C");

        assert_eq!(
            machine.on_recognized(&p, &list, t0),
            AuthEvent::Granted(p.clone())
        );
        assert_eq!(
            machine.on_recognized(&p, &list, t0 + Duration::from_secs(3)),
            AuthEvent::Suppressed
        );
        assert!(!machine.accepting());

        // After the access window the next match starts a new episode.
        assert_eq!(
            machine.on_recognized(&p, &list, t0 + Duration::from_secs(11)),
            AuthEvent::Granted(p)
        );
    }

    #[test]
    fn unknown_plate_does_not_start_recognition() {
        let list = allow(&["AB1234C"]);
        let mut machine = AuthorizationStateMachine::default();
        assert_eq!(
            machine.on_recognized(&plate("ZZ9999"), &list, Instant::now()),
            AuthEvent::NotAllowed
        );
        assert_eq!(machine.phase(), AuthPhase::Idle);
    }
}
