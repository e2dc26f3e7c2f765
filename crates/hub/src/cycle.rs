//! Named group of plants with per-slot aggregate meters.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::error::DomainError;
use crate::growth::{GrowthPhase, PhaseRollup};
use crate::meter::{MeterView, ThresholdMeter};
use crate::plant::Plant;
use crate::problem::{cycle_state, EntityState};
use crate::slot::{Slot, Unit, UnitSystem};

// ---------------------------------------------------------------------------
// Aggregation functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Mean,
    Median,
    Min,
    Max,
    Sum,
    /// Value of the first member (by id) that has one.
    #[serde(alias = "original")]
    First,
}

impl AggregationMethod {
    pub const ALL: [AggregationMethod; 6] = [
        AggregationMethod::Mean,
        AggregationMethod::Median,
        AggregationMethod::Min,
        AggregationMethod::Max,
        AggregationMethod::Sum,
        AggregationMethod::First,
    ];

    pub fn default_for(slot: Slot) -> Self {
        match slot {
            Slot::PowerConsumption => AggregationMethod::Sum,
            _ => AggregationMethod::Mean,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AggregationMethod::Mean => "mean",
            AggregationMethod::Median => "median",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
            AggregationMethod::Sum => "sum",
            AggregationMethod::First => "first",
        }
    }

    /// `None` when no member exposes a value.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        let first = *values.first()?;
        let n = values.len() as f64;
        Some(match self {
            AggregationMethod::Mean => values.iter().sum::<f64>() / n,
            AggregationMethod::Sum => values.iter().sum(),
            AggregationMethod::Min => values.iter().copied().fold(first, f64::min),
            AggregationMethod::Max => values.iter().copied().fold(first, f64::max),
            AggregationMethod::First => first,
            AggregationMethod::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
        })
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "original" {
            return Ok(AggregationMethod::First);
        }
        AggregationMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| format!("unknown aggregation method '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    id: String,
    name: String,
    members: BTreeSet<String>,
    meters: BTreeMap<Slot, ThresholdMeter>,
    /// Per-slot overrides of the default aggregation.
    #[serde(default)]
    aggregations: BTreeMap<Slot, AggregationMethod>,
    propagate_member_problems: bool,
    #[serde(default)]
    phase_rollup: PhaseRollup,
    #[serde(default)]
    state: EntityState,
    #[serde(default)]
    phase: Option<GrowthPhase>,
}

impl Cycle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, units: UnitSystem) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            members: BTreeSet::new(),
            meters: Slot::ALL
                .into_iter()
                .map(|slot| (slot, ThresholdMeter::new(slot, units)))
                .collect(),
            aggregations: BTreeMap::new(),
            propagate_member_problems: true,
            phase_rollup: PhaseRollup::default(),
            state: EntityState::Unknown,
            phase: None,
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, plant_id: &str) -> bool {
        self.members.contains(plant_id)
    }

    pub fn meter(&self, slot: Slot) -> Option<&ThresholdMeter> {
        self.meters.get(&slot)
    }

    pub fn aggregation(&self, slot: Slot) -> AggregationMethod {
        self.aggregations
            .get(&slot)
            .copied()
            .unwrap_or_else(|| AggregationMethod::default_for(slot))
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Rolled-up growth phase of the members.
    pub fn phase(&self) -> Option<GrowthPhase> {
        self.phase
    }

    pub fn propagates_member_problems(&self) -> bool {
        self.propagate_member_problems
    }

    // -- configuration ------------------------------------------------------

    pub fn set_aggregation(&mut self, slot: Slot, method: AggregationMethod) {
        self.aggregations.insert(slot, method);
    }

    pub fn set_propagate_member_problems(&mut self, propagate: bool) {
        self.propagate_member_problems = propagate;
    }

    pub fn set_phase_rollup(&mut self, rollup: PhaseRollup) {
        self.phase_rollup = rollup;
    }

    pub fn set_bounds(&mut self, slot: Slot, min: f64, max: f64) -> Result<bool, DomainError> {
        self.meter_mut(slot)?.set_bounds(min, max)
    }

    pub fn set_problem_enabled(&mut self, slot: Slot, enabled: bool) -> Result<bool, DomainError> {
        Ok(self.meter_mut(slot)?.set_problem_enabled(enabled))
    }

    pub fn set_unit_system(&mut self, units: UnitSystem) -> Result<(), DomainError> {
        self.meter_mut(Slot::Temperature)?
            .convert_unit(Unit::from(units.temperature_unit()))
    }

    fn meter_mut(&mut self, slot: Slot) -> Result<&mut ThresholdMeter, DomainError> {
        self.meters
            .get_mut(&slot)
            .ok_or_else(|| DomainError::InvalidAttribute {
                field: "slot",
                reason: format!("cycle has no {slot} meter"),
            })
    }

    // -- membership ---------------------------------------------------------

    /// Membership bookkeeping only. The garden keeps the plant's back
    /// reference in step and triggers `recompute`.
    pub(crate) fn insert_member(&mut self, plant_id: &str) -> bool {
        self.members.insert(plant_id.to_string())
    }

    pub(crate) fn remove_member(&mut self, plant_id: &str) -> bool {
        self.members.remove(plant_id)
    }

    // -- aggregation ----------------------------------------------------------

    /// Rebuild every aggregate from the members' current meters. `members`
    /// must be exactly the plants listed in this cycle.
    pub fn recompute<'a>(&mut self, members: impl IntoIterator<Item = &'a Plant>, now: OffsetDateTime) {
        let members: Vec<&Plant> = members.into_iter().collect();

        for slot in Slot::ALL {
            let values: Vec<f64> = members
                .iter()
                .filter_map(|p| p.meter(slot)?.value())
                .collect();
            let aggregate = self.aggregation(slot).apply(&values);
            if let Some(meter) = self.meters.get_mut(&slot) {
                match aggregate {
                    Some(_) => meter.update_canonical(aggregate, now),
                    None => meter.clear_value(),
                };
            }
        }

        self.state = cycle_state(
            self.meters.values(),
            members.iter().map(|p| p.state()),
            self.propagate_member_problems,
        );
        self.phase = self.phase_rollup.pick(members.iter().map(|p| p.phase()));
    }

    pub fn summary(&self) -> CycleSummary {
        CycleSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            phase: self.phase,
            member_count: self.members.len(),
            members: self.members.iter().cloned().collect(),
            propagate_member_problems: self.propagate_member_problems,
            meters: self
                .meters
                .values()
                .map(|m| MeterView::new(m, None))
                .collect(),
            aggregations: Slot::ALL
                .into_iter()
                .map(|slot| (slot, self.aggregation(slot)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub id: String,
    pub name: String,
    pub state: EntityState,
    pub phase: Option<GrowthPhase>,
    pub member_count: usize,
    pub members: Vec<String>,
    pub propagate_member_problems: bool,
    pub meters: Vec<MeterView>,
    pub aggregations: BTreeMap<Slot, AggregationMethod>,
}

// ===========================================================================
// Tests
// ===========================================================================
