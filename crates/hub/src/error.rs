use thiserror::Error;
use time::OffsetDateTime;

use crate::growth::GrowthPhase;
use crate::slot::{Slot, Unit};

/// Typed failure of a domain command. A command that returns one of these
/// has left every plant and cycle exactly as it found them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DomainError {
    #[error("invalid bounds for {slot}: min {min} must not exceed max {max}")]
    InvalidBounds { slot: Slot, min: f64, max: f64 },

    #[error("invalid growth phase transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: GrowthPhase,
        to: GrowthPhase,
        reason: &'static str,
    },

    #[error("position at {at} is older than the last recorded position at {last}")]
    OutOfOrderPosition {
        at: OffsetDateTime,
        last: OffsetDateTime,
    },

    #[error("unknown sensor source '{0}'")]
    UnknownSource(String),

    #[error("plant '{plant}' already belongs to cycle '{cycle}'; move it explicitly")]
    AmbiguousCycleMembership { plant: String, cycle: String },

    #[error("no species metadata found for '{0}'")]
    MetadataNotFound(String),

    #[error("unknown plant '{0}'")]
    UnknownPlant(String),

    #[error("unknown cycle '{0}'")]
    UnknownCycle(String),

    #[error("id '{0}' is already in use")]
    DuplicateId(String),

    #[error("{slot} cannot be displayed in {unit}")]
    UnitMismatch { slot: Slot, unit: Unit },

    #[error("invalid treatment '{name}': {reason}")]
    InvalidTreatment { name: String, reason: &'static str },

    #[error("unknown treatment '{0}'")]
    UnknownTreatment(String),

    #[error("invalid image '{url}': {reason}")]
    InvalidImage { url: String, reason: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidAttribute { field: &'static str, reason: String },
}

impl DomainError {
    /// Species misses are reported to the operator but are not failures of
    /// the plant itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DomainError::MetadataNotFound(_))
    }
}
