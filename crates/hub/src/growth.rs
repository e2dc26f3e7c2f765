//! Growth-phase timeline for a single plant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::DomainError;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Declaration order is the lifecycle order; `Removed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthPhase {
    Seed,
    Germination,
    Rooting,
    Growth,
    Flower,
    Harvested,
    Removed,
}

impl GrowthPhase {
    pub const ALL: [GrowthPhase; 7] = [
        GrowthPhase::Seed,
        GrowthPhase::Germination,
        GrowthPhase::Rooting,
        GrowthPhase::Growth,
        GrowthPhase::Flower,
        GrowthPhase::Harvested,
        GrowthPhase::Removed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GrowthPhase::Seed => "seed",
            GrowthPhase::Germination => "germination",
            GrowthPhase::Rooting => "rooting",
            GrowthPhase::Growth => "growth",
            GrowthPhase::Flower => "flower",
            GrowthPhase::Harvested => "harvested",
            GrowthPhase::Removed => "removed",
        }
    }

    /// The direct forward neighbour in the regular lifecycle.
    pub fn next(self) -> Option<GrowthPhase> {
        match self {
            GrowthPhase::Seed => Some(GrowthPhase::Germination),
            GrowthPhase::Germination => Some(GrowthPhase::Rooting),
            GrowthPhase::Rooting => Some(GrowthPhase::Growth),
            GrowthPhase::Growth => Some(GrowthPhase::Flower),
            GrowthPhase::Flower => Some(GrowthPhase::Harvested),
            GrowthPhase::Harvested | GrowthPhase::Removed => None,
        }
    }
}

impl fmt::Display for GrowthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        GrowthPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| format!("unknown growth phase '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub begin: OffsetDateTime,
    /// Whole days spent in the phase, frozen when the next phase begins.
    pub duration_days: Option<i64>,
}

/// Only phases that have begun are stored. The current phase is never kept
/// as a separate field; it is always derived from the records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthPhaseTracker {
    records: BTreeMap<GrowthPhase, PhaseRecord>,
}

impl GrowthPhaseTracker {
    pub fn new(initial: GrowthPhase, at: OffsetDateTime) -> Self {
        let mut records = BTreeMap::new();
        records.insert(
            initial,
            PhaseRecord {
                begin: at,
                duration_days: None,
            },
        );
        Self { records }
    }

    /// The latest phase in lifecycle order that has begun.
    pub fn current(&self) -> GrowthPhase {
        self.records
            .keys()
            .next_back()
            .copied()
            .unwrap_or(GrowthPhase::Seed)
    }

    pub fn begin(&self, phase: GrowthPhase) -> Option<OffsetDateTime> {
        self.records.get(&phase).map(|r| r.begin)
    }

    /// Frozen duration for completed phases, live duration for the current
    /// one, `None` for phases never entered.
    pub fn duration_days(&self, phase: GrowthPhase, now: OffsetDateTime) -> Option<i64> {
        let record = self.records.get(&phase)?;
        if phase == self.current() {
            Some((now - record.begin).whole_days().max(0))
        } else {
            record.duration_days
        }
    }

    pub fn history(&self) -> impl Iterator<Item = (GrowthPhase, &PhaseRecord)> {
        self.records.iter().map(|(p, r)| (*p, r))
    }

    /// Move to `to` at `at`. On success the outgoing phase's duration is
    /// frozen and `to` begins at `at`; no earlier record is touched.
    pub fn transition(&mut self, to: GrowthPhase, at: OffsetDateTime) -> Result<(), DomainError> {
        let from = self.current();
        let reject = |reason| DomainError::InvalidTransition { from, to, reason };

        if from == GrowthPhase::Removed {
            return Err(reject("removed is a terminal phase"));
        }
        if to != GrowthPhase::Removed && from.next() != Some(to) {
            return Err(if to <= from {
                reject("backward transitions are not allowed")
            } else {
                reject("phases cannot be skipped")
            });
        }

        let Some(outgoing) = self.records.get_mut(&from) else {
            return Err(reject("no current phase record"));
        };
        if at < outgoing.begin {
            return Err(reject("transition time precedes the current phase's begin"));
        }

        outgoing.duration_days = Some((at - outgoing.begin).whole_days());
        self.records.insert(
            to,
            PhaseRecord {
                begin: at,
                duration_days: None,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cycle rollup
// ---------------------------------------------------------------------------

/// How a cycle summarises the current phases of its members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseRollup {
    #[default]
    Earliest,
    Latest,
}

impl PhaseRollup {
    /// Members in `Removed` do not count.
    pub fn pick(self, phases: impl IntoIterator<Item = GrowthPhase>) -> Option<GrowthPhase> {
        let live = phases.into_iter().filter(|p| *p != GrowthPhase::Removed);
        match self {
            PhaseRollup::Earliest => live.min(),
            PhaseRollup::Latest => live.max(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-03-01 08:00 UTC);

    fn seedling() -> GrowthPhaseTracker {
        GrowthPhaseTracker::new(GrowthPhase::Seed, T0)
    }

    fn assert_transition_err(tracker: &mut GrowthPhaseTracker, to: GrowthPhase, at: OffsetDateTime) {
        let before = tracker.clone();
        let err = tracker.transition(to, at).unwrap_err();
        assert!(
            matches!(err, DomainError::InvalidTransition { .. }),
            "unexpected error: {err}"
        );
        assert_eq!(*tracker, before, "failed transition mutated the tracker");
    }

    #[test]
    fn starts_in_initial_phase() {
        let t = GrowthPhaseTracker::new(GrowthPhase::Rooting, T0);
        assert_eq!(t.current(), GrowthPhase::Rooting);
        assert_eq!(t.begin(GrowthPhase::Rooting), Some(T0));
        assert_eq!(t.begin(GrowthPhase::Seed), None);
    }

    #[test]
    fn forward_walk_freezes_durations() {
        let mut t = seedling();
        t.transition(GrowthPhase::Germination, T0 + Duration::days(3))
            .unwrap();
        t.transition(GrowthPhase::Rooting, T0 + Duration::days(10))
            .unwrap();

        let now = T0 + Duration::days(15);
        assert_eq!(t.current(), GrowthPhase::Rooting);
        assert_eq!(t.duration_days(GrowthPhase::Seed, now), Some(3));
        assert_eq!(t.duration_days(GrowthPhase::Germination, now), Some(7));
        assert_eq!(t.duration_days(GrowthPhase::Rooting, now), Some(5));
        assert_eq!(t.duration_days(GrowthPhase::Flower, now), None);
    }

    #[test]
    fn earlier_begins_never_rewritten() {
        let mut t = seedling();
        t.transition(GrowthPhase::Germination, T0 + Duration::days(1))
            .unwrap();
        t.transition(GrowthPhase::Removed, T0 + Duration::days(2))
            .unwrap();
        assert_eq!(t.begin(GrowthPhase::Seed), Some(T0));
        assert_eq!(
            t.begin(GrowthPhase::Germination),
            Some(T0 + Duration::days(1))
        );
    }

    #[test]
    fn backward_transition_rejected() {
        let mut t = GrowthPhaseTracker::new(GrowthPhase::Flower, T0);
        assert_transition_err(&mut t, GrowthPhase::Seed, T0 + Duration::days(1));
        assert_transition_err(&mut t, GrowthPhase::Flower, T0 + Duration::days(1));
    }

    #[test]
    fn skipping_rejected() {
        let mut t = seedling();
        assert_transition_err(&mut t, GrowthPhase::Flower, T0 + Duration::days(1));
    }

    #[test]
    fn removed_reachable_from_every_live_phase() {
        for phase in GrowthPhase::ALL {
            if phase == GrowthPhase::Removed {
                continue;
            }
            let mut t = GrowthPhaseTracker::new(phase, T0);
            t.transition(GrowthPhase::Removed, T0 + Duration::hours(1))
                .unwrap_or_else(|e| panic!("{phase} -> removed: {e}"));
            assert_eq!(t.current(), GrowthPhase::Removed);
        }
    }

    #[test]
    fn removed_is_absorbing() {
        let mut t = GrowthPhaseTracker::new(GrowthPhase::Removed, T0);
        for phase in GrowthPhase::ALL {
            assert_transition_err(&mut t, phase, T0 + Duration::days(1));
        }
    }

    #[test]
    fn transition_before_current_begin_rejected() {
        let mut t = GrowthPhaseTracker::new(GrowthPhase::Growth, T0);
        assert_transition_err(&mut t, GrowthPhase::Flower, T0 - Duration::minutes(1));
    }

    #[test]
    fn same_instant_transition_is_zero_days() {
        let mut t = GrowthPhaseTracker::new(GrowthPhase::Flower, T0);
        t.transition(GrowthPhase::Harvested, T0).unwrap();
        assert_eq!(t.duration_days(GrowthPhase::Flower, T0), Some(0));
    }

    #[test]
    fn phase_display_and_parse() {
        assert_eq!(GrowthPhase::Harvested.to_string(), "harvested");
        assert_eq!("Flower".parse::<GrowthPhase>().unwrap(), GrowthPhase::Flower);
        assert!("bloom".parse::<GrowthPhase>().is_err());
    }

    #[test]
    fn tracker_snapshot_roundtrip() {
        let mut t = seedling();
        t.transition(GrowthPhase::Germination, T0 + Duration::days(2))
            .unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: GrowthPhaseTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.current(), GrowthPhase::Germination);
    }

    #[test]
    fn rollup_ignores_removed() {
        let phases = [GrowthPhase::Removed, GrowthPhase::Growth, GrowthPhase::Flower];
        assert_eq!(PhaseRollup::Earliest.pick(phases), Some(GrowthPhase::Growth));
        assert_eq!(PhaseRollup::Latest.pick(phases), Some(GrowthPhase::Flower));
        assert_eq!(PhaseRollup::Latest.pick([GrowthPhase::Removed]), None);
    }
}
