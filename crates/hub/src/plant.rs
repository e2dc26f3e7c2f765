//! A single tracked plant: meters, bindings, growth timeline and the
//! user-maintained metadata around them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::binding::{resolve_source, BindingOutcome, SensorBinding, SensorSource};
use crate::dli::DliIntegrator;
use crate::error::DomainError;
use crate::garden::Settings;
use crate::growth::{GrowthPhase, GrowthPhaseTracker};
use crate::meter::{check_bounds, MeterView, ThresholdMeter};
use crate::problem::{plant_state, EntityState};
use crate::slot::{Slot, Unit, UnitSystem};
use crate::species::{Picture, PictureOrigin, SpeciesInfo, SpeciesRecord};

/// Treatments every plant offers without configuration.
pub const BUILTIN_TREATMENTS: [&str; 8] = [
    "cut",
    "super cropping",
    "topping",
    "lollipop",
    "fim",
    "rib",
    "spray pest",
    "spray water",
];

const DEFAULT_POT_SIZE_L: f64 = 0.4;
const DEFAULT_WATER_CAPACITY_PCT: f64 = 50.0;
const MAX_HEALTH: f64 = 5.0;

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Treatment {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attributes {
    pub notes: Option<String>,
    /// Litres.
    pub pot_size: f64,
    /// Percent of pot volume.
    pub water_capacity: f64,
    /// 0 to 5 in half steps.
    pub health: f64,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            notes: None,
            pot_size: DEFAULT_POT_SIZE_L,
            water_capacity: DEFAULT_WATER_CAPACITY_PCT,
            health: MAX_HEALTH,
        }
    }
}

/// Partial update of textual and numeric plant fields. Absent fields are
/// left as they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AttributeUpdate {
    pub name: Option<String>,
    pub breeder: Option<String>,
    pub notes: Option<String>,
    pub flowering_days: Option<u32>,
    pub pot_size: Option<f64>,
    pub water_capacity: Option<f64>,
    pub health: Option<f64>,
}

impl AttributeUpdate {
    fn validate(&self) -> Result<(), DomainError> {
        let invalid = |field, reason: &str| DomainError::InvalidAttribute {
            field,
            reason: reason.to_string(),
        };
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(invalid("name", "must not be empty"));
            }
        }
        if let Some(size) = self.pot_size {
            if !size.is_finite() || size <= 0.0 {
                return Err(invalid("pot_size", "must be a positive number of litres"));
            }
        }
        if let Some(cap) = self.water_capacity {
            if !(0.0..=100.0).contains(&cap) {
                return Err(invalid("water_capacity", "must be within 0..=100 %"));
            }
        }
        if let Some(health) = self.health {
            if !(0.0..=MAX_HEALTH).contains(&health) || (health * 2.0).fract() != 0.0 {
                return Err(invalid("health", "must be within 0..=5 in steps of 0.5"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plant {
    id: String,
    name: String,
    species: SpeciesInfo,
    images: Vec<String>,
    treatments: Vec<Treatment>,
    positions: Vec<Position>,
    growth: GrowthPhaseTracker,
    meters: BTreeMap<Slot, ThresholdMeter>,
    bindings: BTreeMap<Slot, SensorBinding>,
    dli: DliIntegrator,
    cycle: Option<String>,
    attributes: Attributes,
}

impl Plant {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        species: SpeciesInfo,
        settings: &Settings,
        created_at: OffsetDateTime,
    ) -> Self {
        let meters = Slot::ALL
            .into_iter()
            .map(|slot| (slot, ThresholdMeter::new(slot, settings.units)))
            .collect();
        let bindings = Slot::ALL
            .into_iter()
            .filter(|slot| slot.is_sourced())
            .map(|slot| (slot, SensorBinding::new(slot)))
            .collect();
        Self {
            id: id.into(),
            name: name.into(),
            species,
            images: Vec::new(),
            treatments: Vec::new(),
            positions: Vec::new(),
            growth: GrowthPhaseTracker::new(settings.initial_phase, created_at),
            meters,
            bindings,
            dli: DliIntegrator::new(),
            cycle: None,
            attributes: Attributes::default(),
        }
    }

    /// A fresh plant carrying this one's species, attributes, treatments and
    /// thresholds. Readings, bindings, history, images and cycle membership
    /// stay behind.
    pub fn clone_as(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        settings: &Settings,
        created_at: OffsetDateTime,
    ) -> Self {
        let mut plant = Self::new(id, name, self.species.clone(), settings, created_at);
        plant.attributes = self.attributes.clone();
        plant.treatments = self.treatments.clone();
        for (slot, meter) in &mut plant.meters {
            if let Some(template) = self.meters.get(slot) {
                meter.copy_thresholds_from(template);
            }
        }
        plant
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn species(&self) -> &SpeciesInfo {
        &self.species
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn treatments(&self) -> &[Treatment] {
        &self.treatments
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn current_position(&self) -> Option<&Position> {
        self.positions.last()
    }

    pub fn growth(&self) -> &GrowthPhaseTracker {
        &self.growth
    }

    pub fn phase(&self) -> GrowthPhase {
        self.growth.current()
    }

    pub fn meter(&self, slot: Slot) -> Option<&ThresholdMeter> {
        self.meters.get(&slot)
    }

    pub fn meters(&self) -> impl Iterator<Item = &ThresholdMeter> {
        self.meters.values()
    }

    pub fn binding(&self, slot: Slot) -> Option<&SensorBinding> {
        self.bindings.get(&slot)
    }

    pub fn dli(&self) -> &DliIntegrator {
        &self.dli
    }

    /// Id of the cycle this plant belongs to. Lookup only; the cycle owns
    /// the membership.
    pub fn cycle_ref(&self) -> Option<&str> {
        self.cycle.as_deref()
    }

    pub(crate) fn set_cycle_ref(&mut self, cycle: Option<String>) {
        self.cycle = cycle;
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn state(&self) -> EntityState {
        plant_state(self.meters.values())
    }

    /// Whether any slot is bound to `entity_id`.
    pub fn is_bound_to(&self, entity_id: &str) -> bool {
        self.bindings.values().any(|b| b.source() == Some(entity_id))
    }

    // -- sensor bindings ------------------------------------------------------

    /// Point `slot` at a new source, or unbind it with `None`. The old value
    /// is discarded and the new source's current value adopted before the
    /// call returns.
    pub fn replace_sensor(
        &mut self,
        slot: Slot,
        source: Option<&str>,
        sources: &dyn SensorSource,
        settings: &Settings,
        now: OffsetDateTime,
    ) -> Result<(), DomainError> {
        if !self.bindings.contains_key(&slot) {
            return Err(DomainError::InvalidAttribute {
                field: "slot",
                reason: format!("{slot} is derived and cannot be bound to a sensor"),
            });
        }
        let initial = source
            .map(|id| resolve_source(sources, id).map(|state| (id, state)))
            .transpose()?;

        if let Some(binding) = self.bindings.get_mut(&slot) {
            match initial {
                Some((id, _)) => binding.bind(id),
                None => binding.unbind(),
            }
        }
        if let Some(meter) = self.meters.get_mut(&slot) {
            meter.clear_value();
        }
        if slot == Slot::Illuminance {
            self.dli.mark_gap();
            self.refresh_dli_meter(now);
        }

        if let Some((id, state)) = initial {
            self.on_source_value(slot, id, state.value, state.timestamp, settings);
        }
        Ok(())
    }

    /// Deliver a reading for `slot`. Only values from the bound source in
    /// timestamp order reach the meter. `value == None` marks the source as
    /// unavailable: the meter keeps its last value.
    pub fn on_source_value(
        &mut self,
        slot: Slot,
        entity_id: &str,
        value: Option<f64>,
        timestamp: OffsetDateTime,
        settings: &Settings,
    ) -> BindingOutcome {
        let Some(binding) = self.bindings.get_mut(&slot) else {
            return BindingOutcome::Unbound;
        };
        let outcome = binding.on_source_value(entity_id, timestamp);
        if outcome != BindingOutcome::Accepted {
            return outcome;
        }

        match value {
            Some(v) => {
                if let Some(meter) = self.meters.get_mut(&slot) {
                    meter.update_value(v, timestamp);
                }
                if slot == Slot::Illuminance
                    && self
                        .dli
                        .add_sample(timestamp, v * settings.lux_to_ppfd, settings.offset())
                {
                    self.refresh_dli_meter(timestamp);
                }
            }
            None if slot == Slot::Illuminance => {
                self.dli.mark_gap();
            }
            None => {}
        }
        outcome
    }

    /// Deliver a reading to every slot bound to `entity_id`.
    pub fn ingest(
        &mut self,
        entity_id: &str,
        value: Option<f64>,
        timestamp: OffsetDateTime,
        settings: &Settings,
    ) -> Vec<(Slot, BindingOutcome)> {
        let slots: Vec<Slot> = self
            .bindings
            .values()
            .filter(|b| b.source() == Some(entity_id))
            .map(|b| b.slot())
            .collect();
        slots
            .into_iter()
            .map(|slot| {
                let outcome = self.on_source_value(slot, entity_id, value, timestamp, settings);
                (slot, outcome)
            })
            .collect()
    }

    /// Close the DLI day if local midnight has passed. Returns whether the
    /// published DLI changed.
    pub fn roll_dli(&mut self, now: OffsetDateTime, settings: &Settings) -> bool {
        if self.dli.roll_to(now, settings.offset()) {
            self.refresh_dli_meter(now);
            true
        } else {
            false
        }
    }

    fn refresh_dli_meter(&mut self, now: OffsetDateTime) {
        let illuminance_bound = self
            .bindings
            .get(&Slot::Illuminance)
            .is_some_and(SensorBinding::is_bound);
        if let Some(meter) = self.meters.get_mut(&Slot::Dli) {
            if illuminance_bound {
                meter.update_canonical(self.dli.published(), now);
            } else {
                meter.clear_value();
            }
        }
    }

    // -- thresholds -----------------------------------------------------------

    pub fn set_bounds(&mut self, slot: Slot, min: f64, max: f64) -> Result<bool, DomainError> {
        let meter = self.meter_mut(slot)?;
        meter.set_bounds(min, max)
    }

    /// Install the species' recommended bounds on every meter. Nothing
    /// changes unless all of them are valid.
    pub fn reset_bounds(&mut self, record: &SpeciesRecord) -> Result<(), DomainError> {
        for slot in self.meters.keys() {
            let (min, max) = record.limit_for(*slot);
            check_bounds(*slot, min, max)?;
        }
        for (slot, meter) in &mut self.meters {
            let (min, max) = record.limit_for(*slot);
            meter.set_canonical_bounds(min, max)?;
        }
        Ok(())
    }

    pub fn set_problem_enabled(&mut self, slot: Slot, enabled: bool) -> Result<bool, DomainError> {
        Ok(self.meter_mut(slot)?.set_problem_enabled(enabled))
    }

    /// Follow the host's unit preference. Only the temperature presentation
    /// changes.
    pub fn set_unit_system(&mut self, units: UnitSystem) -> Result<(), DomainError> {
        self.meter_mut(Slot::Temperature)?
            .convert_unit(Unit::from(units.temperature_unit()))
    }

    fn meter_mut(&mut self, slot: Slot) -> Result<&mut ThresholdMeter, DomainError> {
        self.meters
            .get_mut(&slot)
            .ok_or_else(|| DomainError::InvalidAttribute {
                field: "slot",
                reason: format!("plant has no {slot} meter"),
            })
    }

    // -- growth & position ------------------------------------------------------

    pub fn transition_phase(
        &mut self,
        to: GrowthPhase,
        at: OffsetDateTime,
    ) -> Result<(), DomainError> {
        self.growth.transition(to, at)
    }

    pub fn change_position(&mut self, x: f64, y: f64, at: OffsetDateTime) -> Result<(), DomainError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(DomainError::InvalidAttribute {
                field: "position",
                reason: format!("coordinates must be finite, got ({x}, {y})"),
            });
        }
        if let Some(last) = self.positions.last() {
            if at < last.timestamp {
                return Err(DomainError::OutOfOrderPosition {
                    at,
                    last: last.timestamp,
                });
            }
        }
        self.positions.push(Position { timestamp: at, x, y });
        Ok(())
    }

    // -- treatments -------------------------------------------------------------

    pub fn add_treatment(&mut self, name: &str, color: &str) -> Result<(), DomainError> {
        let name = name.trim();
        let reject = |reason| DomainError::InvalidTreatment {
            name: name.to_string(),
            reason,
        };
        if name.is_empty() {
            return Err(reject("name must not be empty"));
        }
        if BUILTIN_TREATMENTS
            .iter()
            .any(|builtin| builtin.eq_ignore_ascii_case(name))
        {
            return Err(reject("a built-in treatment has this name"));
        }
        if self
            .treatments
            .iter()
            .any(|t| t.name.eq_ignore_ascii_case(name))
        {
            return Err(reject("a custom treatment has this name"));
        }
        let color = color.trim();
        if color.is_empty() {
            return Err(reject("color must not be empty"));
        }
        self.treatments.push(Treatment {
            name: name.to_string(),
            color: color.to_string(),
        });
        Ok(())
    }

    pub fn remove_treatment(&mut self, name: &str) -> Result<(), DomainError> {
        let name = name.trim();
        let idx = self
            .treatments
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DomainError::UnknownTreatment(name.to_string()))?;
        self.treatments.remove(idx);
        Ok(())
    }

    // -- images -------------------------------------------------------------------

    pub fn add_image(&mut self, url: &str) -> Result<(), DomainError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DomainError::InvalidImage {
                url: url.to_string(),
                reason: "url must not be empty",
            });
        }
        if self.images.iter().any(|i| i == url) {
            return Err(DomainError::InvalidImage {
                url: url.to_string(),
                reason: "already in the image list",
            });
        }
        self.images.push(url.to_string());
        Ok(())
    }

    pub fn remove_image(&mut self, url: &str) -> Result<(), DomainError> {
        let idx = self.image_index(url)?;
        self.images.remove(idx);
        if self
            .species
            .picture
            .as_ref()
            .is_some_and(|p| p.url == url)
        {
            self.species.picture = None;
        }
        Ok(())
    }

    /// Move `url` to the front of the list and make it the plant picture.
    pub fn set_main_image(&mut self, url: &str) -> Result<(), DomainError> {
        let idx = self.image_index(url)?;
        let image = self.images.remove(idx);
        self.images.insert(0, image.clone());
        self.species.picture = Some(Picture {
            url: image,
            origin: PictureOrigin::User,
        });
        Ok(())
    }

    fn image_index(&self, url: &str) -> Result<usize, DomainError> {
        self.images
            .iter()
            .position(|i| i == url)
            .ok_or_else(|| DomainError::InvalidImage {
                url: url.to_string(),
                reason: "not in the image list",
            })
    }

    // -- metadata -----------------------------------------------------------------

    /// Apply every field or none of them.
    pub fn update_attributes(&mut self, update: &AttributeUpdate) -> Result<(), DomainError> {
        update.validate()?;
        if let Some(name) = &update.name {
            self.name = name.trim().to_string();
        }
        if let Some(breeder) = &update.breeder {
            self.species.breeder = Some(breeder.clone());
        }
        if let Some(notes) = &update.notes {
            self.attributes.notes = Some(notes.clone());
        }
        if let Some(days) = update.flowering_days {
            self.species.flowering_days = Some(days);
        }
        if let Some(size) = update.pot_size {
            self.attributes.pot_size = size;
        }
        if let Some(cap) = update.water_capacity {
            self.attributes.water_capacity = cap;
        }
        if let Some(health) = update.health {
            self.attributes.health = health;
        }
        Ok(())
    }

    pub fn set_species(&mut self, species: SpeciesInfo) {
        self.species = species;
    }

    // -- view ---------------------------------------------------------------------

    pub fn summary(&self, now: OffsetDateTime) -> PlantSummary {
        let phase_days = self
            .growth
            .history()
            .filter_map(|(phase, _)| Some((phase, self.growth.duration_days(phase, now)?)))
            .collect();
        let meters = self
            .meters
            .values()
            .map(|m| {
                let source = self.bindings.get(&m.slot()).and_then(SensorBinding::source);
                MeterView::new(m, source)
            })
            .collect();
        PlantSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            species: self.species.label().to_string(),
            species_id: self.species.species_id.clone(),
            picture: self.species.picture.as_ref().map(|p| p.url.clone()),
            state: self.state(),
            phase: self.phase(),
            phase_days,
            cycle: self.cycle.clone(),
            position: self.current_position().copied(),
            dli: self.dli.published(),
            images: self.images.clone(),
            treatments: self.treatments.clone(),
            attributes: self.attributes.clone(),
            meters,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlantSummary {
    pub id: String,
    pub name: String,
    pub species: String,
    pub species_id: String,
    pub picture: Option<String>,
    pub state: EntityState,
    pub phase: GrowthPhase,
    pub phase_days: BTreeMap<GrowthPhase, i64>,
    pub cycle: Option<String>,
    pub position: Option<Position>,
    pub dli: Option<f64>,
    pub images: Vec<String>,
    pub treatments: Vec<Treatment>,
    pub attributes: Attributes,
    pub meters: Vec<MeterView>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::SourceState;
    use std::collections::HashMap;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-06-01 10:00 UTC);

    fn settings() -> Settings {
        Settings::default()
    }

    fn test_plant() -> Plant {
        Plant::new("plant_1", "Basil", SpeciesInfo::new("basil"), &settings(), T0)
    }

    fn sources() -> HashMap<String, SourceState> {
        let mut map = HashMap::new();
        for (id, value) in [
            ("sensor.soil_a", Some(15.0)),
            ("sensor.soil_b", Some(45.0)),
            ("sensor.lux", Some(10_000.0)),
            ("sensor.offline", None),
        ] {
            map.insert(
                id.to_string(),
                SourceState {
                    value,
                    timestamp: T0,
                },
            );
        }
        map
    }

    #[test]
    fn new_plant_starts_unknown_in_initial_phase() {
        let p = test_plant();
        assert_eq!(p.state(), EntityState::Unknown);
        assert_eq!(p.phase(), GrowthPhase::Rooting);
        assert_eq!(p.meters().count(), Slot::ALL.len());
        assert!(p.binding(Slot::Dli).is_none());
        assert_eq!(p.attributes().pot_size, 0.4);
    }

    // -- rebinding ------------------------------------------------------------

    #[test]
    fn bind_adopts_current_value_immediately() {
        let mut p = test_plant();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &settings(), T0)
            .unwrap();
        assert_eq!(p.meter(Slot::Moisture).unwrap().value(), Some(15.0));
        assert_eq!(p.state(), EntityState::Problem);
    }

    #[test]
    fn rebind_discards_old_value_and_ignores_old_source() {
        let mut p = test_plant();
        let s = settings();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_b"), &sources(), &s, T0)
            .unwrap();
        assert_eq!(p.meter(Slot::Moisture).unwrap().value(), Some(45.0));

        let late = p.on_source_value(
            Slot::Moisture,
            "sensor.soil_a",
            Some(1.0),
            T0 + Duration::minutes(1),
            &s,
        );
        assert_eq!(late, BindingOutcome::WrongSource);
        assert_eq!(p.meter(Slot::Moisture).unwrap().value(), Some(45.0));
        assert_eq!(p.state(), EntityState::Ok);
    }

    #[test]
    fn bind_to_unknown_source_changes_nothing() {
        let mut p = test_plant();
        let s = settings();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        let before = p.clone();
        let err = p
            .replace_sensor(Slot::Moisture, Some("light.kitchen"), &sources(), &s, T0)
            .unwrap_err();
        assert_eq!(err, DomainError::UnknownSource("light.kitchen".into()));
        assert_eq!(p, before);
    }

    #[test]
    fn unbind_clears_value() {
        let mut p = test_plant();
        let s = settings();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        p.replace_sensor(Slot::Moisture, None, &sources(), &s, T0)
            .unwrap();
        assert_eq!(p.meter(Slot::Moisture).unwrap().value(), None);
        assert!(!p.is_bound_to("sensor.soil_a"));
        assert_eq!(p.state(), EntityState::Unknown);
    }

    #[test]
    fn dli_slot_cannot_be_bound() {
        let mut p = test_plant();
        assert!(p
            .replace_sensor(Slot::Dli, Some("sensor.lux"), &sources(), &settings(), T0)
            .is_err());
    }

    #[test]
    fn unavailable_source_freezes_last_value() {
        let mut p = test_plant();
        let s = settings();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        let outcome = p.on_source_value(
            Slot::Moisture,
            "sensor.soil_a",
            None,
            T0 + Duration::minutes(5),
            &s,
        );
        assert_eq!(outcome, BindingOutcome::Accepted);
        assert_eq!(p.meter(Slot::Moisture).unwrap().value(), Some(15.0));
        assert!(p.meter(Slot::Moisture).unwrap().problem());
    }

    #[test]
    fn ingest_fans_out_to_every_bound_slot() {
        let mut p = test_plant();
        let s = settings();
        p.replace_sensor(Slot::Moisture, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        p.replace_sensor(Slot::Humidity, Some("sensor.soil_a"), &sources(), &s, T0)
            .unwrap();
        let outcomes = p.ingest("sensor.soil_a", Some(30.0), T0 + Duration::minutes(1), &s);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(p.meter(Slot::Humidity).unwrap().value(), Some(30.0));
    }

    #[test]
    fn illuminance_feeds_dli_meter_after_midnight() {
        let mut p = test_plant();
        let s = settings();
        let start = datetime!(2024-06-01 00:00 UTC);
        let dark = HashMap::from([(
            "sensor.lux".to_string(),
            SourceState {
                value: Some(0.0),
                timestamp: start,
            },
        )]);
        p.replace_sensor(Slot::Illuminance, Some("sensor.lux"), &dark, &s, start)
            .unwrap();
        let lux = 7200.0 / s.lux_to_ppfd;
        p.on_source_value(
            Slot::Illuminance,
            "sensor.lux",
            Some(lux),
            start + Duration::hours(1),
            &s,
        );
        assert!((p.dli().accumulated() - 12.96).abs() < 1e-6);
        assert_eq!(p.meter(Slot::Dli).unwrap().value(), None);

        assert!(p.roll_dli(datetime!(2024-06-02 00:01 UTC), &s));
        let published = p.meter(Slot::Dli).unwrap().value().unwrap();
        assert!((published - 12.96).abs() < 1e-6);
    }

    // -- thresholds -----------------------------------------------------------

    #[test]
    fn unit_system_switch_keeps_canonical_bounds() {
        let mut p = test_plant();
        p.set_unit_system(UnitSystem::Imperial).unwrap();
        let meter = p.meter(Slot::Temperature).unwrap();
        assert_eq!(meter.display_bounds().0, 50.0);
        assert_eq!(meter.bounds().0, 10.0);
    }

    #[test]
    fn invalid_bounds_leave_meter_untouched() {
        let mut p = test_plant();
        let before = p.clone();
        assert!(p.set_bounds(Slot::Moisture, 80.0, 10.0).is_err());
        assert_eq!(p, before);
    }

    // -- growth & position ------------------------------------------------------

    #[test]
    fn positions_must_be_chronological() {
        let mut p = test_plant();
        p.change_position(1.0, 2.0, T0).unwrap();
        p.change_position(3.0, 4.0, T0 + Duration::hours(1)).unwrap();
        let err = p.change_position(5.0, 6.0, T0).unwrap_err();
        assert!(matches!(err, DomainError::OutOfOrderPosition { .. }));
        assert_eq!(p.positions().len(), 2);
        assert_eq!(p.current_position().map(|pos| pos.x), Some(3.0));
    }

    #[test]
    fn equal_position_timestamps_allowed() {
        let mut p = test_plant();
        p.change_position(1.0, 2.0, T0).unwrap();
        p.change_position(1.5, 2.5, T0).unwrap();
        assert_eq!(p.positions().len(), 2);
    }

    // -- treatments -------------------------------------------------------------

    #[test]
    fn custom_treatment_lifecycle() {
        let mut p = test_plant();
        p.add_treatment("  Defoliate ", "#00ff00").unwrap();
        assert_eq!(p.treatments()[0].name, "Defoliate");

        assert!(matches!(
            p.add_treatment("defoliate", "#000000"),
            Err(DomainError::InvalidTreatment { .. })
        ));
        assert!(matches!(
            p.add_treatment("Topping", "#000000"),
            Err(DomainError::InvalidTreatment { .. })
        ));
        assert!(p.add_treatment("   ", "#000000").is_err());

        p.remove_treatment("DEFOLIATE").unwrap();
        assert_eq!(
            p.remove_treatment("defoliate"),
            Err(DomainError::UnknownTreatment("defoliate".into()))
        );
    }

    // -- images -----------------------------------------------------------------

    #[test]
    fn main_image_moves_to_front_and_becomes_picture() {
        let mut p = test_plant();
        p.add_image("/local/a.jpg").unwrap();
        p.add_image("/local/b.jpg").unwrap();
        assert!(p.add_image("/local/a.jpg").is_err());

        p.set_main_image("/local/b.jpg").unwrap();
        assert_eq!(p.images(), ["/local/b.jpg", "/local/a.jpg"]);
        assert_eq!(
            p.species().picture.as_ref().map(|pic| pic.url.as_str()),
            Some("/local/b.jpg")
        );

        p.remove_image("/local/b.jpg").unwrap();
        assert_eq!(p.species().picture, None);
        assert!(p.set_main_image("/local/zzz.jpg").is_err());
    }

    // -- attributes ---------------------------------------------------------------

    #[test]
    fn attribute_update_is_all_or_nothing() {
        let mut p = test_plant();
        let before = p.clone();
        let update = AttributeUpdate {
            name: Some("Thai Basil".into()),
            health: Some(4.3),
            ..AttributeUpdate::default()
        };
        assert!(matches!(
            p.update_attributes(&update),
            Err(DomainError::InvalidAttribute { field: "health", .. })
        ));
        assert_eq!(p, before);

        let update = AttributeUpdate {
            name: Some("Thai Basil".into()),
            health: Some(3.5),
            flowering_days: Some(56),
            ..AttributeUpdate::default()
        };
        p.update_attributes(&update).unwrap();
        assert_eq!(p.name(), "Thai Basil");
        assert_eq!(p.attributes().health, 3.5);
        assert_eq!(p.species().flowering_days, Some(56));
    }

    #[test]
    fn attribute_ranges() {
        let mut p = test_plant();
        for bad in [
            AttributeUpdate {
                pot_size: Some(0.0),
                ..AttributeUpdate::default()
            },
            AttributeUpdate {
                water_capacity: Some(101.0),
                ..AttributeUpdate::default()
            },
            AttributeUpdate {
                name: Some(" ".into()),
                ..AttributeUpdate::default()
            },
        ] {
            assert!(p.update_attributes(&bad).is_err(), "{bad:?} accepted");
        }
    }

    // -- view -----------------------------------------------------------------------

    #[test]
    fn summary_reports_live_phase_duration() {
        let p = test_plant();
        let summary = p.summary(T0 + Duration::days(4));
        assert_eq!(summary.phase_days.get(&GrowthPhase::Rooting), Some(&4));
        assert_eq!(summary.species, "basil");
        assert_eq!(summary.meters.len(), Slot::ALL.len());
        serde_json::to_value(&summary).unwrap();
    }

    #[test]
    fn illuminance_rebind_opens_gap_and_unbind_clears_dli() {
        let mut p = test_plant();
        let s = settings();
        let start = datetime!(2024-06-01 00:00 UTC);
        let lux = 7200.0 / s.lux_to_ppfd;
        let lamps = HashMap::from([
            (
                "sensor.lux".to_string(),
                SourceState {
                    value: Some(0.0),
                    timestamp: start,
                },
            ),
            (
                "sensor.lux_b".to_string(),
                SourceState {
                    value: Some(lux),
                    timestamp: start + Duration::hours(2),
                },
            ),
        ]);
        p.replace_sensor(Slot::Illuminance, Some("sensor.lux"), &lamps, &s, start)
            .unwrap();
        p.on_source_value(
            Slot::Illuminance,
            "sensor.lux",
            Some(lux),
            start + Duration::hours(1),
            &s,
        );
        assert!((p.dli().accumulated() - 12.96).abs() < 1e-6);

        // 01:00 to 02:00 falls in the gap and adds nothing.
        p.replace_sensor(
            Slot::Illuminance,
            Some("sensor.lux_b"),
            &lamps,
            &s,
            start + Duration::hours(2),
        )
        .unwrap();
        assert!((p.dli().accumulated() - 12.96).abs() < 1e-6);
        p.on_source_value(
            Slot::Illuminance,
            "sensor.lux_b",
            Some(lux),
            start + Duration::hours(3),
            &s,
        );
        assert!((p.dli().accumulated() - 38.88).abs() < 1e-6);

        assert!(p.roll_dli(datetime!(2024-06-02 00:01 UTC), &s));
        assert!(p.meter(Slot::Dli).unwrap().value().is_some());

        p.replace_sensor(Slot::Illuminance, None, &lamps, &s, datetime!(2024-06-02 00:02 UTC))
            .unwrap();
        assert_eq!(p.meter(Slot::Dli).unwrap().value(), None);
        assert!(!p.meter(Slot::Dli).unwrap().problem());
    }
}
