//! Domain commands as they arrive from MQTT or HTTP.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::binding::SensorSource;
use crate::cycle::AggregationMethod;
use crate::error::DomainError;
use crate::garden::{ChangeSet, Garden, NewPlant};
use crate::growth::{GrowthPhase, PhaseRollup};
use crate::plant::AttributeUpdate;
use crate::slot::{Slot, UnitSystem};

fn default_treatment_color() -> String {
    "#808080".to_string()
}

/// Which entity a threshold command addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Plant(String),
    Cycle(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreatePlant {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        species_id: Option<String>,
    },
    /// Copy a plant's species, attributes and thresholds into a new plant.
    /// Only `sensors` are bound on the copy.
    ClonePlant {
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        sensors: BTreeMap<Slot, String>,
    },
    RemovePlant {
        plant: String,
    },
    /// `source: null` unbinds the slot.
    ReplaceSensor {
        plant: String,
        slot: Slot,
        #[serde(default)]
        source: Option<String>,
    },
    SetBounds {
        target: Target,
        slot: Slot,
        min: f64,
        max: f64,
    },
    SetProblemEnabled {
        target: Target,
        slot: Slot,
        enabled: bool,
    },
    TransitionPhase {
        plant: String,
        phase: GrowthPhase,
        #[serde(default, with = "time::serde::rfc3339::option")]
        at: Option<OffsetDateTime>,
    },
    CreateCycle {
        #[serde(default)]
        id: Option<String>,
        name: String,
    },
    RemoveCycle {
        cycle: String,
    },
    ConfigureCycle {
        cycle: String,
        #[serde(default)]
        aggregations: BTreeMap<Slot, AggregationMethod>,
        #[serde(default)]
        propagate_member_problems: Option<bool>,
        #[serde(default)]
        phase_rollup: Option<PhaseRollup>,
    },
    AddToCycle {
        plants: Vec<String>,
        cycle: String,
    },
    /// `cycle: null` takes the plants out of any cycle.
    MoveToCycle {
        plants: Vec<String>,
        #[serde(default)]
        cycle: Option<String>,
    },
    ChangePosition {
        plant: String,
        x: f64,
        y: f64,
        #[serde(default, with = "time::serde::rfc3339::option")]
        at: Option<OffsetDateTime>,
    },
    AddTreatment {
        plant: String,
        name: String,
        #[serde(default = "default_treatment_color")]
        color: String,
    },
    RemoveTreatment {
        plant: String,
        name: String,
    },
    AddImage {
        plant: String,
        url: String,
    },
    RemoveImage {
        plant: String,
        url: String,
    },
    SetMainImage {
        plant: String,
        url: String,
    },
    UpdateAttributes {
        plant: String,
        attributes: AttributeUpdate,
    },
    SetUnitSystem {
        units: UnitSystem,
    },
    /// Runs asynchronously; the reply only confirms the plant exists.
    RefreshSpecies {
        plant: String,
        #[serde(default)]
        species_id: Option<String>,
        #[serde(default)]
        force: bool,
    },
}

/// Parameters of a species refresh, split off before the command is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    pub plant: String,
    pub species_id: Option<String>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandReply {
    Applied {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        changes: ChangeSet,
    },
    Accepted {
        plant: String,
    },
}

impl CommandReply {
    pub fn changes(&self) -> Option<&ChangeSet> {
        match self {
            CommandReply::Applied { changes, .. } => Some(changes),
            CommandReply::Accepted { .. } => None,
        }
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreatePlant { .. } => "create_plant",
            Command::ClonePlant { .. } => "clone_plant",
            Command::RemovePlant { .. } => "remove_plant",
            Command::ReplaceSensor { .. } => "replace_sensor",
            Command::SetBounds { .. } => "set_bounds",
            Command::SetProblemEnabled { .. } => "set_problem_enabled",
            Command::TransitionPhase { .. } => "transition_phase",
            Command::CreateCycle { .. } => "create_cycle",
            Command::RemoveCycle { .. } => "remove_cycle",
            Command::ConfigureCycle { .. } => "configure_cycle",
            Command::AddToCycle { .. } => "add_to_cycle",
            Command::MoveToCycle { .. } => "move_to_cycle",
            Command::ChangePosition { .. } => "change_position",
            Command::AddTreatment { .. } => "add_treatment",
            Command::RemoveTreatment { .. } => "remove_treatment",
            Command::AddImage { .. } => "add_image",
            Command::RemoveImage { .. } => "remove_image",
            Command::SetMainImage { .. } => "set_main_image",
            Command::UpdateAttributes { .. } => "update_attributes",
            Command::SetUnitSystem { .. } => "set_unit_system",
            Command::RefreshSpecies { .. } => "refresh_species",
        }
    }

    pub fn refresh_request(&self) -> Option<RefreshRequest> {
        match self {
            Command::RefreshSpecies {
                plant,
                species_id,
                force,
            } => Some(RefreshRequest {
                plant: plant.clone(),
                species_id: species_id.clone(),
                force: *force,
            }),
            _ => None,
        }
    }

    /// Run the command against the garden. On `Err` nothing was changed.
    pub fn apply(
        self,
        garden: &mut Garden,
        sources: &dyn SensorSource,
        now: OffsetDateTime,
    ) -> Result<CommandReply, DomainError> {
        let applied = |changes| CommandReply::Applied { id: None, changes };
        let changes = match self {
            Command::CreatePlant {
                id,
                name,
                species_id,
            } => {
                let (id, changes) = garden.create_plant(
                    NewPlant {
                        id,
                        name,
                        species_id,
                    },
                    now,
                )?;
                return Ok(CommandReply::Applied {
                    id: Some(id),
                    changes,
                });
            }
            Command::ClonePlant {
                source,
                name,
                sensors,
            } => {
                let (id, changes) =
                    garden.clone_plant(&source, name.as_deref(), &sensors, sources, now)?;
                return Ok(CommandReply::Applied {
                    id: Some(id),
                    changes,
                });
            }
            Command::CreateCycle { id, name } => {
                let (id, changes) = garden.create_cycle(id.as_deref(), &name)?;
                return Ok(CommandReply::Applied {
                    id: Some(id),
                    changes,
                });
            }
            Command::RefreshSpecies { plant, .. } => {
                garden.species_of(&plant)?;
                return Ok(CommandReply::Accepted { plant });
            }
            Command::RemovePlant { plant } => garden.remove_plant(&plant, now)?,
            Command::ReplaceSensor {
                plant,
                slot,
                source,
            } => garden.replace_sensor(&plant, slot, source.as_deref(), sources, now)?,
            Command::SetBounds {
                target: Target::Plant(id),
                slot,
                min,
                max,
            } => garden.set_plant_bounds(&id, slot, min, max, now)?,
            Command::SetBounds {
                target: Target::Cycle(id),
                slot,
                min,
                max,
            } => garden.set_cycle_bounds(&id, slot, min, max, now)?,
            Command::SetProblemEnabled {
                target: Target::Plant(id),
                slot,
                enabled,
            } => garden.set_plant_problem_enabled(&id, slot, enabled, now)?,
            Command::SetProblemEnabled {
                target: Target::Cycle(id),
                slot,
                enabled,
            } => garden.set_cycle_problem_enabled(&id, slot, enabled, now)?,
            Command::TransitionPhase { plant, phase, at } => {
                garden.transition_phase(&plant, phase, at.unwrap_or(now), now)?
            }
            Command::RemoveCycle { cycle } => garden.remove_cycle(&cycle)?,
            Command::ConfigureCycle {
                cycle,
                aggregations,
                propagate_member_problems,
                phase_rollup,
            } => garden.configure_cycle(
                &cycle,
                &aggregations,
                propagate_member_problems,
                phase_rollup,
                now,
            )?,
            Command::AddToCycle { plants, cycle } => garden.add_to_cycle(&plants, &cycle, now)?,
            Command::MoveToCycle { plants, cycle } => {
                garden.move_to_cycle(&plants, cycle.as_deref(), now)?
            }
            Command::ChangePosition { plant, x, y, at } => {
                garden.change_position(&plant, x, y, at.unwrap_or(now))?
            }
            Command::AddTreatment { plant, name, color } => {
                garden.add_treatment(&plant, &name, &color)?
            }
            Command::RemoveTreatment { plant, name } => garden.remove_treatment(&plant, &name)?,
            Command::AddImage { plant, url } => garden.add_image(&plant, &url)?,
            Command::RemoveImage { plant, url } => garden.remove_image(&plant, &url)?,
            Command::SetMainImage { plant, url } => garden.set_main_image(&plant, &url)?,
            Command::UpdateAttributes { plant, attributes } => {
                garden.update_attributes(&plant, &attributes)?
            }
            Command::SetUnitSystem { units } => garden.set_unit_system(units)?,
        };
        Ok(applied(changes))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
