//! User-facing state derived from meter problem flags.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::meter::ThresholdMeter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Ok,
    Problem,
    #[default]
    Unknown,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityState::Ok => "ok",
            EntityState::Problem => "problem",
            EntityState::Unknown => "unknown",
        })
    }
}

/// Unknown until at least one meter holds a value. Meters with problem
/// evaluation disabled never raise a problem but still count as known.
pub fn plant_state<'a>(meters: impl IntoIterator<Item = &'a ThresholdMeter>) -> EntityState {
    let mut known = false;
    for meter in meters {
        if meter.problem() {
            return EntityState::Problem;
        }
        known |= meter.value().is_some();
    }
    if known {
        EntityState::Ok
    } else {
        EntityState::Unknown
    }
}

/// A cycle is in trouble if its own aggregates are, or (when propagating)
/// if any member is.
pub fn cycle_state<'a>(
    own: impl IntoIterator<Item = &'a ThresholdMeter>,
    members: impl IntoIterator<Item = EntityState>,
    propagate: bool,
) -> EntityState {
    let own = plant_state(own);
    if own == EntityState::Problem {
        return own;
    }
    let mut known = own == EntityState::Ok;
    for member in members {
        if propagate && member == EntityState::Problem {
            return EntityState::Problem;
        }
        known |= member != EntityState::Unknown;
    }
    if known {
        EntityState::Ok
    } else {
        EntityState::Unknown
    }
}

// ===========================================================================
// Tests
// ===========================================================================
