//! Registry of all plants and cycles. Every mutation goes through here so
//! the plant → cycle recomputation cascade runs exactly once per change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::binding::{BindingOutcome, SensorSource};
use crate::cycle::{AggregationMethod, Cycle};
use crate::dli::DEFAULT_LUX_TO_PPFD;
use crate::error::DomainError;
use crate::growth::{GrowthPhase, PhaseRollup};
use crate::plant::{AttributeUpdate, Plant};
use crate::slot::{Slot, UnitSystem};
use crate::species::{merge, MergeOutcome, SpeciesInfo, SpeciesRecord};

// ---------------------------------------------------------------------------
// Settings & bookkeeping
// ---------------------------------------------------------------------------

/// Host-wide preferences. Passed explicitly into every operation that
/// depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(alias = "unit_system")]
    pub units: UnitSystem,
    /// Fixed offset of the local day used for DLI.
    pub utc_offset_minutes: i32,
    pub lux_to_ppfd: f64,
    pub initial_phase: GrowthPhase,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            units: UnitSystem::Metric,
            utc_offset_minutes: 0,
            lux_to_ppfd: DEFAULT_LUX_TO_PPFD,
            initial_phase: GrowthPhase::Rooting,
        }
    }
}

impl Settings {
    pub fn offset(&self) -> UtcOffset {
        UtcOffset::from_whole_seconds(self.utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC)
    }
}

/// Counters for sensor callbacks, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub accepted: u64,
    /// Values from a source no slot is bound to (any more).
    pub dropped_wrong_source: u64,
    /// Values older than the last accepted one for the slot.
    pub dropped_regressed: u64,
}

/// Ids touched by an operation, for the caller to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub plants: BTreeSet<String>,
    pub cycles: BTreeSet<String>,
    pub removed_plants: BTreeSet<String>,
    pub removed_cycles: BTreeSet<String>,
    pub settings: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.plants.is_empty()
            && self.cycles.is_empty()
            && self.removed_plants.is_empty()
            && self.removed_cycles.is_empty()
            && !self.settings
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.plants.extend(other.plants);
        self.cycles.extend(other.cycles);
        self.removed_plants.extend(other.removed_plants);
        self.removed_cycles.extend(other.removed_cycles);
        self.settings |= other.settings;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NewPlant {
    pub id: Option<String>,
    pub name: String,
    pub species_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Garden
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Garden {
    plants: BTreeMap<String, Plant>,
    cycles: BTreeMap<String, Cycle>,
    settings: Settings,
    diagnostics: Diagnostics,
}

impl Garden {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Rebuild from persisted snapshots. Cycle membership is authoritative:
    /// plant back references are re-derived from it and every aggregate is
    /// recomputed.
    pub fn restore(
        settings: Settings,
        plants: impl IntoIterator<Item = Plant>,
        cycles: impl IntoIterator<Item = Cycle>,
        now: OffsetDateTime,
    ) -> Self {
        let mut garden = Self::new(settings);
        for mut plant in plants {
            plant.set_cycle_ref(None);
            garden.plants.insert(plant.id().to_string(), plant);
        }
        for mut cycle in cycles {
            let stale: Vec<String> = cycle
                .members()
                .filter(|m| {
                    garden
                        .plants
                        .get(*m)
                        .map_or(true, |p| p.cycle_ref().is_some())
                })
                .map(str::to_string)
                .collect();
            for member in &stale {
                warn!(cycle = %cycle.id(), plant = %member, "dropping stale cycle member");
                cycle.remove_member(member);
            }
            for member in cycle.members() {
                if let Some(plant) = garden.plants.get_mut(member) {
                    plant.set_cycle_ref(Some(cycle.id().to_string()));
                }
            }
            garden.cycles.insert(cycle.id().to_string(), cycle);
        }
        let ids: Vec<String> = garden.cycles.keys().cloned().collect();
        for id in ids {
            garden.recompute_cycle(&id, now);
        }
        garden
    }

    // -- queries --------------------------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn plant(&self, id: &str) -> Option<&Plant> {
        self.plants.get(id)
    }

    pub fn plants(&self) -> impl Iterator<Item = &Plant> {
        self.plants.values()
    }

    pub fn cycle(&self, id: &str) -> Option<&Cycle> {
        self.cycles.get(id)
    }

    pub fn cycles(&self) -> impl Iterator<Item = &Cycle> {
        self.cycles.values()
    }

    /// Species currently recorded for a plant.
    pub fn species_of(&self, plant_id: &str) -> Result<SpeciesInfo, DomainError> {
        Ok(self.plant_ref(plant_id)?.species().clone())
    }

    // -- plants ---------------------------------------------------------------

    pub fn create_plant(
        &mut self,
        new: NewPlant,
        now: OffsetDateTime,
    ) -> Result<(String, ChangeSet), DomainError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidAttribute {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        let id = match new.id.as_deref().map(str::trim) {
            Some("") => {
                return Err(DomainError::InvalidAttribute {
                    field: "id",
                    reason: "must not be empty".into(),
                })
            }
            Some(id) if self.plants.contains_key(id) => {
                return Err(DomainError::DuplicateId(id.to_string()))
            }
            Some(id) => id.to_string(),
            None => next_free_id("plant", |id| self.plants.contains_key(id)),
        };
        let species = SpeciesInfo::new(new.species_id.unwrap_or_default());
        let plant = Plant::new(id.clone(), name, species, &self.settings, now);
        self.plants.insert(id.clone(), plant);

        let mut changes = ChangeSet::default();
        changes.plants.insert(id.clone());
        Ok((id, changes))
    }

    /// Create a new plant from an existing one. Only the sensors listed in
    /// `sensors` are bound; without a name the clone is called
    /// `<source name>_<n>`.
    pub fn clone_plant(
        &mut self,
        source_id: &str,
        name: Option<&str>,
        sensors: &BTreeMap<Slot, String>,
        sources: &dyn SensorSource,
        now: OffsetDateTime,
    ) -> Result<(String, ChangeSet), DomainError> {
        let template = self.plant_ref(source_id)?;
        let name = match name.map(str::trim) {
            Some("") => {
                return Err(DomainError::InvalidAttribute {
                    field: "name",
                    reason: "must not be empty".into(),
                })
            }
            Some(name) => name.to_string(),
            None => self.next_free_name(template.name()),
        };
        let id = next_free_id("plant", |id| self.plants.contains_key(id));
        let settings = self.settings;
        let mut plant = template.clone_as(id.clone(), name, &settings, now);
        for (slot, entity) in sensors {
            plant.replace_sensor(*slot, Some(entity), sources, &settings, now)?;
        }
        self.plants.insert(id.clone(), plant);
        Ok((id.clone(), plant_only(&id)))
    }

    pub fn remove_plant(&mut self, id: &str, now: OffsetDateTime) -> Result<ChangeSet, DomainError> {
        let plant = self
            .plants
            .remove(id)
            .ok_or_else(|| DomainError::UnknownPlant(id.to_string()))?;
        let mut changes = ChangeSet::default();
        changes.removed_plants.insert(id.to_string());
        if let Some(cycle_id) = plant.cycle_ref() {
            if let Some(cycle) = self.cycles.get_mut(cycle_id) {
                cycle.remove_member(id);
            }
            self.recompute_cycle(cycle_id, now);
            changes.cycles.insert(cycle_id.to_string());
        }
        Ok(changes)
    }

    pub fn replace_sensor(
        &mut self,
        plant_id: &str,
        slot: Slot,
        source: Option<&str>,
        sources: &dyn SensorSource,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        let settings = self.settings;
        self.plant_mut(plant_id)?
            .replace_sensor(slot, source, sources, &settings, now)?;
        Ok(self.cascade_from(plant_id, now))
    }

    pub fn set_plant_bounds(
        &mut self,
        plant_id: &str,
        slot: Slot,
        min: f64,
        max: f64,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.set_bounds(slot, min, max)?;
        Ok(self.cascade_from(plant_id, now))
    }

    pub fn set_plant_problem_enabled(
        &mut self,
        plant_id: &str,
        slot: Slot,
        enabled: bool,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.set_problem_enabled(slot, enabled)?;
        Ok(self.cascade_from(plant_id, now))
    }

    pub fn transition_phase(
        &mut self,
        plant_id: &str,
        phase: GrowthPhase,
        at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.transition_phase(phase, at)?;
        Ok(self.cascade_from(plant_id, now))
    }

    pub fn change_position(
        &mut self,
        plant_id: &str,
        x: f64,
        y: f64,
        at: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.change_position(x, y, at)?;
        Ok(plant_only(plant_id))
    }

    pub fn add_treatment(&mut self, plant_id: &str, name: &str, color: &str) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.add_treatment(name, color)?;
        Ok(plant_only(plant_id))
    }

    pub fn remove_treatment(&mut self, plant_id: &str, name: &str) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.remove_treatment(name)?;
        Ok(plant_only(plant_id))
    }

    pub fn add_image(&mut self, plant_id: &str, url: &str) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.add_image(url)?;
        Ok(plant_only(plant_id))
    }

    pub fn remove_image(&mut self, plant_id: &str, url: &str) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.remove_image(url)?;
        Ok(plant_only(plant_id))
    }

    pub fn set_main_image(&mut self, plant_id: &str, url: &str) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.set_main_image(url)?;
        Ok(plant_only(plant_id))
    }

    pub fn update_attributes(
        &mut self,
        plant_id: &str,
        update: &AttributeUpdate,
    ) -> Result<ChangeSet, DomainError> {
        self.plant_mut(plant_id)?.update_attributes(update)?;
        Ok(plant_only(plant_id))
    }

    /// Apply fetched species metadata under the merge policy. A forced
    /// refresh also resets the plant's bounds to the species limits. A miss
    /// leaves the plant as it was.
    pub fn apply_species(
        &mut self,
        plant_id: &str,
        requested_id: &str,
        fetched: Option<SpeciesRecord>,
        force: bool,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        let limits = fetched.clone().filter(|_| force);
        let plant = self.plant_mut(plant_id)?;
        match merge(plant.species(), requested_id, fetched, force)? {
            MergeOutcome::Skipped => Ok(ChangeSet::default()),
            MergeOutcome::Updated(info) => {
                if let Some(record) = &limits {
                    plant.reset_bounds(record)?;
                }
                plant.set_species(info);
                Ok(self.cascade_from(plant_id, now))
            }
        }
    }

    // -- cycles ---------------------------------------------------------------

    pub fn create_cycle(
        &mut self,
        id: Option<&str>,
        name: &str,
    ) -> Result<(String, ChangeSet), DomainError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DomainError::InvalidAttribute {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        let id = match id.map(str::trim) {
            Some("") => {
                return Err(DomainError::InvalidAttribute {
                    field: "id",
                    reason: "must not be empty".into(),
                })
            }
            Some(id) if self.cycles.contains_key(id) => {
                return Err(DomainError::DuplicateId(id.to_string()))
            }
            Some(id) => id.to_string(),
            None => next_free_id("cycle", |id| self.cycles.contains_key(id)),
        };
        self.cycles
            .insert(id.clone(), Cycle::new(id.clone(), name, self.settings.units));
        let mut changes = ChangeSet::default();
        changes.cycles.insert(id.clone());
        Ok((id, changes))
    }

    pub fn cycle_mut(&mut self, id: &str) -> Result<&mut Cycle, DomainError> {
        self.cycles
            .get_mut(id)
            .ok_or_else(|| DomainError::UnknownCycle(id.to_string()))
    }

    /// Members are released; they keep their data but no longer point at
    /// any cycle.
    pub fn remove_cycle(&mut self, id: &str) -> Result<ChangeSet, DomainError> {
        let cycle = self
            .cycles
            .remove(id)
            .ok_or_else(|| DomainError::UnknownCycle(id.to_string()))?;
        let mut changes = ChangeSet::default();
        changes.removed_cycles.insert(id.to_string());
        for member in cycle.members() {
            if let Some(plant) = self.plants.get_mut(member) {
                plant.set_cycle_ref(None);
                changes.plants.insert(member.to_string());
            }
        }
        Ok(changes)
    }

    pub fn set_cycle_bounds(
        &mut self,
        cycle_id: &str,
        slot: Slot,
        min: f64,
        max: f64,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.cycle_mut(cycle_id)?.set_bounds(slot, min, max)?;
        self.recompute_cycle(cycle_id, now);
        Ok(cycle_only(cycle_id))
    }

    pub fn set_cycle_problem_enabled(
        &mut self,
        cycle_id: &str,
        slot: Slot,
        enabled: bool,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        self.cycle_mut(cycle_id)?.set_problem_enabled(slot, enabled)?;
        self.recompute_cycle(cycle_id, now);
        Ok(cycle_only(cycle_id))
    }

    pub fn configure_cycle(
        &mut self,
        cycle_id: &str,
        aggregations: &BTreeMap<Slot, AggregationMethod>,
        propagate_member_problems: Option<bool>,
        phase_rollup: Option<PhaseRollup>,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        let cycle = self.cycle_mut(cycle_id)?;
        for (slot, method) in aggregations {
            cycle.set_aggregation(*slot, *method);
        }
        if let Some(propagate) = propagate_member_problems {
            cycle.set_propagate_member_problems(propagate);
        }
        if let Some(rollup) = phase_rollup {
            cycle.set_phase_rollup(rollup);
        }
        self.recompute_cycle(cycle_id, now);
        Ok(cycle_only(cycle_id))
    }

    /// Add plants that are not in any cycle yet. A plant owned by another
    /// cycle must be moved explicitly with `move_to_cycle`.
    pub fn add_to_cycle(
        &mut self,
        plant_ids: &[String],
        cycle_id: &str,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        if !self.cycles.contains_key(cycle_id) {
            return Err(DomainError::UnknownCycle(cycle_id.to_string()));
        }
        for id in plant_ids {
            match self.plant_ref(id)?.cycle_ref() {
                Some(owner) if owner != cycle_id => {
                    return Err(DomainError::AmbiguousCycleMembership {
                        plant: id.clone(),
                        cycle: owner.to_string(),
                    })
                }
                _ => {}
            }
        }
        self.move_validated(plant_ids, Some(cycle_id), now)
    }

    /// Move plants into `target`, leaving whatever cycle they were in, or out
    /// of every cycle with `None`.
    pub fn move_to_cycle(
        &mut self,
        plant_ids: &[String],
        target: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        if let Some(cycle_id) = target {
            if !self.cycles.contains_key(cycle_id) {
                return Err(DomainError::UnknownCycle(cycle_id.to_string()));
            }
        }
        for id in plant_ids {
            self.plant_ref(id)?;
        }
        self.move_validated(plant_ids, target, now)
    }

    fn move_validated(
        &mut self,
        plant_ids: &[String],
        target: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<ChangeSet, DomainError> {
        let mut changes = ChangeSet::default();
        for id in plant_ids {
            let Some(plant) = self.plants.get_mut(id) else {
                continue;
            };
            let previous = plant.cycle_ref().map(str::to_string);
            if previous.as_deref() == target {
                continue;
            }
            plant.set_cycle_ref(target.map(str::to_string));
            changes.plants.insert(id.clone());

            if let Some(old) = previous {
                if let Some(cycle) = self.cycles.get_mut(&old) {
                    cycle.remove_member(id);
                }
                changes.cycles.insert(old);
            }
            if let Some(new) = target {
                if let Some(cycle) = self.cycles.get_mut(new) {
                    cycle.insert_member(id);
                }
                changes.cycles.insert(new.to_string());
            }
        }
        for cycle_id in &changes.cycles {
            self.recompute_cycle(cycle_id, now);
        }
        Ok(changes)
    }

    // -- host signals -----------------------------------------------------------

    /// The host switched between metric and imperial.
    pub fn set_unit_system(&mut self, units: UnitSystem) -> Result<ChangeSet, DomainError> {
        let mut changes = ChangeSet {
            settings: true,
            ..ChangeSet::default()
        };
        for (id, plant) in &mut self.plants {
            plant.set_unit_system(units)?;
            changes.plants.insert(id.clone());
        }
        for (id, cycle) in &mut self.cycles {
            cycle.set_unit_system(units)?;
            changes.cycles.insert(id.clone());
        }
        self.settings.units = units;
        Ok(changes)
    }

    /// A bound source reported a new value (`None` = unavailable). Fans out
    /// to every slot bound to `entity_id` and cascades into cycles.
    pub fn on_source_value(
        &mut self,
        entity_id: &str,
        value: Option<f64>,
        timestamp: OffsetDateTime,
    ) -> ChangeSet {
        let settings = self.settings;
        let mut touched = Vec::new();
        for (id, plant) in &mut self.plants {
            if !plant.is_bound_to(entity_id) {
                continue;
            }
            let mut accepted = false;
            for (slot, outcome) in plant.ingest(entity_id, value, timestamp, &settings) {
                match outcome {
                    BindingOutcome::Accepted => {
                        self.diagnostics.accepted += 1;
                        accepted = true;
                    }
                    BindingOutcome::Regressed => {
                        self.diagnostics.dropped_regressed += 1;
                        warn!(plant = %id, %slot, source = entity_id, "dropping regressed reading");
                    }
                    BindingOutcome::WrongSource | BindingOutcome::Unbound => {
                        self.diagnostics.dropped_wrong_source += 1;
                    }
                }
            }
            if accepted {
                touched.push(id.clone());
            }
        }

        if touched.is_empty() {
            if !self.plants.values().any(|p| p.is_bound_to(entity_id)) {
                self.diagnostics.dropped_wrong_source += 1;
                debug!(source = entity_id, "no slot bound to source");
            }
            return ChangeSet::default();
        }
        let mut changes = ChangeSet::default();
        for id in touched {
            changes.merge(self.cascade_from(&id, timestamp));
        }
        changes
    }

    /// Periodic housekeeping: close DLI days that ended before `now`.
    pub fn tick(&mut self, now: OffsetDateTime) -> ChangeSet {
        let settings = self.settings;
        let rolled: Vec<String> = self
            .plants
            .iter_mut()
            .filter_map(|(id, plant)| plant.roll_dli(now, &settings).then(|| id.clone()))
            .collect();
        let mut changes = ChangeSet::default();
        for id in rolled {
            changes.merge(self.cascade_from(&id, now));
        }
        changes
    }

    // -- internals ----------------------------------------------------------------

    fn plant_ref(&self, id: &str) -> Result<&Plant, DomainError> {
        self.plants
            .get(id)
            .ok_or_else(|| DomainError::UnknownPlant(id.to_string()))
    }

    fn next_free_name(&self, base: &str) -> String {
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|name| !self.plants.values().any(|p| p.name() == name))
            .unwrap_or_else(|| format!("{base}_copy"))
    }

    fn plant_mut(&mut self, id: &str) -> Result<&mut Plant, DomainError> {
        self.plants
            .get_mut(id)
            .ok_or_else(|| DomainError::UnknownPlant(id.to_string()))
    }

    /// The plant has finished its own recomputation; bring its cycle up to
    /// date.
    fn cascade_from(&mut self, plant_id: &str, now: OffsetDateTime) -> ChangeSet {
        let mut changes = plant_only(plant_id);
        let cycle_id = self
            .plants
            .get(plant_id)
            .and_then(|p| p.cycle_ref())
            .map(str::to_string);
        if let Some(cycle_id) = cycle_id {
            self.recompute_cycle(&cycle_id, now);
            changes.cycles.insert(cycle_id);
        }
        changes
    }

    fn recompute_cycle(&mut self, cycle_id: &str, now: OffsetDateTime) {
        let plants = &self.plants;
        if let Some(cycle) = self.cycles.get_mut(cycle_id) {
            let members: Vec<&Plant> = cycle.members().filter_map(|m| plants.get(m)).collect();
            cycle.recompute(members, now);
        }
    }
}

fn plant_only(plant_id: &str) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.plants.insert(plant_id.to_string());
    changes
}

fn cycle_only(cycle_id: &str) -> ChangeSet {
    let mut changes = ChangeSet::default();
    changes.cycles.insert(cycle_id.to_string());
    changes
}

/// `<prefix>_<n>` with the smallest n ≥ 1 not yet taken.
fn next_free_id(prefix: &str, taken: impl Fn(&str) -> bool) -> String {
    (1..)
        .map(|n| format!("{prefix}_{n}"))
        .find(|id| !taken(id))
        .unwrap_or_else(|| format!("{prefix}_0"))
}

// ===========================================================================
// Tests
// ===========================================================================
