//! TOML config file loading, validation, and garden seeding for plants,
//! cycles, known sensor sources and the species catalog.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use time::OffsetDateTime;

use crate::binding::SENSOR_DOMAIN;
use crate::cycle::AggregationMethod;
use crate::garden::{ChangeSet, Garden, NewPlant, Settings};
use crate::growth::PhaseRollup;
use crate::meter::check_bounds;
use crate::slot::Slot;
use crate::species::SpeciesRecord;
use crate::state::SourceCache;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Only used to seed a database that has no settings yet.
    #[serde(default)]
    pub settings: Option<Settings>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub species: Vec<SpeciesRecord>,
    #[serde(default)]
    pub plants: Vec<PlantEntry>,
    #[serde(default)]
    pub cycles: Vec<CycleEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SourceEntry {
    pub entity_id: String,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PlantEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub species_id: Option<String>,
    #[serde(default)]
    pub sensors: BTreeMap<Slot, String>,
    #[serde(default)]
    pub thresholds: BTreeMap<Slot, ThresholdEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CycleEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub aggregations: BTreeMap<Slot, AggregationMethod>,
    #[serde(default)]
    pub propagate_member_problems: Option<bool>,
    #[serde(default)]
    pub phase_rollup: Option<PhaseRollup>,
    #[serde(default)]
    pub thresholds: BTreeMap<Slot, ThresholdEntry>,
}

/// Bounds are given in the display unit of the configured unit system.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThresholdEntry {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub problem: Option<bool>,
}

/// A local day never starts more than 18 hours away from UTC.
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_settings(&mut errors);
        self.validate_sources(&mut errors);
        self.validate_species(&mut errors);
        self.validate_plants(&mut errors);
        self.validate_cycles(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_settings(&self, errors: &mut Vec<String>) {
        let Some(s) = &self.settings else {
            return;
        };
        if !(-MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&s.utc_offset_minutes) {
            errors.push(format!(
                "settings: utc_offset_minutes {} out of range [-{MAX_UTC_OFFSET_MINUTES}, {MAX_UTC_OFFSET_MINUTES}]",
                s.utc_offset_minutes
            ));
        }
        if !s.lux_to_ppfd.is_finite() || s.lux_to_ppfd <= 0.0 {
            errors.push(format!(
                "settings: lux_to_ppfd must be positive, got {}",
                s.lux_to_ppfd
            ));
        }
    }

    fn validate_sources(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, s) in self.sources.iter().enumerate() {
            let ctx = if s.entity_id.is_empty() {
                format!("sources[{i}]")
            } else {
                format!("source '{}'", s.entity_id)
            };
            match s.entity_id.strip_prefix(SENSOR_DOMAIN) {
                Some(object) if !object.trim().is_empty() => {}
                _ => errors.push(format!(
                    "{ctx}: entity_id must look like '{SENSOR_DOMAIN}<name>'"
                )),
            }
            if !seen.insert(&s.entity_id) {
                errors.push(format!("{ctx}: duplicate entity_id"));
            }
            if let Some(v) = s.value {
                if !v.is_finite() {
                    errors.push(format!("{ctx}: value must be finite"));
                }
            }
        }
    }

    fn validate_species(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<String> = HashSet::new();
        for (i, s) in self.species.iter().enumerate() {
            if s.species_id.trim().is_empty() {
                errors.push(format!("species[{i}]: species_id is empty"));
            } else if !seen.insert(s.species_id.to_lowercase()) {
                errors.push(format!("species '{}': duplicate species_id", s.species_id));
            }
            for (slot, limit) in &s.limits {
                if let Err(e) = check_bounds(*slot, limit.min, limit.max) {
                    errors.push(format!("species '{}': {e}", s.species_id));
                }
            }
        }
    }

    fn validate_plants(&self, errors: &mut Vec<String>) {
        let known_sources: HashSet<&str> =
            self.sources.iter().map(|s| s.entity_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.plants.iter().enumerate() {
            let ctx = || {
                if p.id.is_empty() {
                    format!("plants[{i}]")
                } else {
                    format!("plant '{}'", p.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&p.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Sensor bindings ─────────────────────────────────
            for (slot, entity) in &p.sensors {
                if !slot.is_sourced() {
                    errors.push(format!(
                        "{}: slot '{slot}' is derived and cannot be bound to a sensor",
                        ctx()
                    ));
                } else if !known_sources.contains(entity.as_str()) {
                    errors.push(format!(
                        "{}: sensor '{entity}' for slot '{slot}' is not a declared source",
                        ctx()
                    ));
                }
            }

            validate_thresholds(&ctx(), &p.thresholds, errors);
        }
    }

    fn validate_cycles(&self, errors: &mut Vec<String>) {
        let plant_ids: HashSet<&str> = self.plants.iter().map(|p| p.id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();

        for (i, c) in self.cycles.iter().enumerate() {
            let ctx = || {
                if c.id.is_empty() {
                    format!("cycles[{i}]")
                } else {
                    format!("cycle '{}'", c.id)
                }
            };

            if c.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&c.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Membership ──────────────────────────────────────
            for member in &c.members {
                if !plant_ids.contains(member.as_str()) {
                    errors.push(format!("{}: unknown member plant '{member}'", ctx()));
                    continue;
                }
                match owner.insert(member.as_str(), c.id.as_str()) {
                    Some(prev) if prev == c.id => {
                        errors.push(format!("{}: member '{member}' listed twice", ctx()));
                    }
                    Some(prev) => errors.push(format!(
                        "{}: plant '{member}' is already a member of cycle '{prev}'",
                        ctx()
                    )),
                    None => {}
                }
            }

            validate_thresholds(&ctx(), &c.thresholds, errors);
        }
    }
}

fn validate_thresholds(ctx: &str, thresholds: &BTreeMap<Slot, ThresholdEntry>, errors: &mut Vec<String>) {
    for (slot, t) in thresholds {
        if !t.min.is_finite() || !t.max.is_finite() {
            errors.push(format!("{ctx}: {slot} bounds must be finite"));
        } else if t.min > t.max {
            errors.push(format!(
                "{ctx}: {slot} min ({}) must not exceed max ({})",
                t.min, t.max
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Declare the configured sources and create every plant and cycle the
/// garden does not know yet. Entities restored from the database are left
/// untouched so runtime edits survive a restart.
pub fn apply(
    config: &Config,
    garden: &mut Garden,
    sources: &mut SourceCache,
    now: OffsetDateTime,
) -> Result<ChangeSet> {
    for s in &config.sources {
        sources.declare(&s.entity_id, now);
        if s.value.is_some() {
            sources.record(&s.entity_id, s.value, now);
        }
    }

    let catalog: HashMap<String, &SpeciesRecord> = config
        .species
        .iter()
        .map(|r| (r.species_id.to_lowercase(), r))
        .collect();

    let mut changes = ChangeSet::default();
    let mut created_plants = 0usize;
    for p in &config.plants {
        if garden.plant(&p.id).is_some() {
            continue;
        }
        let record = p
            .species_id
            .as_deref()
            .and_then(|s| catalog.get(&s.to_lowercase()))
            .map(|r| (*r).clone());
        let (id, c) = garden
            .create_plant(
                NewPlant {
                    id: Some(p.id.clone()),
                    name: p.name.clone(),
                    // Filled in by the catalog merge below when the
                    // species is known. Its limits come first so the
                    // thresholds listed here win.
                    species_id: if record.is_some() {
                        None
                    } else {
                        p.species_id.clone()
                    },
                },
                now,
            )
            .with_context(|| format!("failed to create plant '{}'", p.id))?;
        changes.merge(c);
        created_plants += 1;

        if let (Some(species_id), Some(record)) = (p.species_id.as_deref(), record) {
            changes.merge(
                garden
                    .apply_species(&id, species_id, Some(record), true, now)
                    .with_context(|| format!("plant '{id}': invalid species limits"))?,
            );
        }

        for (slot, entity) in &p.sensors {
            let c = garden
                .replace_sensor(&id, *slot, Some(entity), &*sources, now)
                .with_context(|| format!("plant '{id}': failed to bind {slot} to '{entity}'"))?;
            changes.merge(c);
        }
        for (slot, t) in &p.thresholds {
            changes.merge(
                garden
                    .set_plant_bounds(&id, *slot, t.min, t.max, now)
                    .with_context(|| format!("plant '{id}': invalid {slot} bounds"))?,
            );
            if let Some(enabled) = t.problem {
                changes.merge(garden.set_plant_problem_enabled(&id, *slot, enabled, now)?);
            }
        }
    }

    let mut created_cycles = 0usize;
    for c in &config.cycles {
        if garden.cycle(&c.id).is_some() {
            continue;
        }
        let (id, cs) = garden
            .create_cycle(Some(&c.id), &c.name)
            .with_context(|| format!("failed to create cycle '{}'", c.id))?;
        changes.merge(cs);
        created_cycles += 1;

        // Plants that already belong to a restored cycle stay where they are.
        let free: Vec<String> = c
            .members
            .iter()
            .filter(|m| garden.plant(m).is_some_and(|p| p.cycle_ref().is_none()))
            .cloned()
            .collect();
        if free.len() != c.members.len() {
            tracing::warn!(
                cycle = %id,
                skipped = c.members.len() - free.len(),
                "config members already assigned elsewhere"
            );
        }
        if !free.is_empty() {
            changes.merge(garden.add_to_cycle(&free, &id, now)?);
        }
        changes.merge(garden.configure_cycle(
            &id,
            &c.aggregations,
            c.propagate_member_problems,
            c.phase_rollup,
            now,
        )?);
        for (slot, t) in &c.thresholds {
            changes.merge(
                garden
                    .set_cycle_bounds(&id, *slot, t.min, t.max, now)
                    .with_context(|| format!("cycle '{id}': invalid {slot} bounds"))?,
            );
            if let Some(enabled) = t.problem {
                changes.merge(garden.set_cycle_problem_enabled(&id, *slot, enabled, now)?);
            }
        }
    }

    tracing::info!(
        sources = config.sources.len(),
        species = config.species.len(),
        plants_created = created_plants,
        cycles_created = created_cycles,
        "config applied"
    );

    Ok(changes)
}

// ===========================================================================
// Tests
// ===========================================================================
