//! Redirectable pointer from a measurement slot to an external sensor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

use crate::error::DomainError;
use crate::slot::Slot;

/// Entity-id prefix of bindable sources.
pub const SENSOR_DOMAIN: &str = "sensor.";

// ---------------------------------------------------------------------------
// Host capability
// ---------------------------------------------------------------------------

/// Latest state the host knows for a source. `value == None` means the
/// source exists but is currently unavailable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceState {
    pub value: Option<f64>,
    pub timestamp: OffsetDateTime,
}

/// Read access to the host's current sensor values.
pub trait SensorSource {
    fn current(&self, entity_id: &str) -> Option<SourceState>;
}

impl SensorSource for HashMap<String, SourceState> {
    fn current(&self, entity_id: &str) -> Option<SourceState> {
        self.get(entity_id).copied()
    }
}

/// Check that `entity_id` may be bound and return its current state.
pub fn resolve_source(
    sources: &dyn SensorSource,
    entity_id: &str,
) -> Result<SourceState, DomainError> {
    if !entity_id.starts_with(SENSOR_DOMAIN) {
        return Err(DomainError::UnknownSource(entity_id.to_string()));
    }
    sources
        .current(entity_id)
        .ok_or_else(|| DomainError::UnknownSource(entity_id.to_string()))
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingOutcome {
    Accepted,
    /// Callback tagged with a source that is no longer (or never was) bound.
    WrongSource,
    /// Timestamp older than the last accepted one for this slot.
    Regressed,
    Unbound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBinding {
    slot: Slot,
    source: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_timestamp: Option<OffsetDateTime>,
}

impl SensorBinding {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            source: None,
            last_timestamp: None,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.source.is_some()
    }

    pub fn last_timestamp(&self) -> Option<OffsetDateTime> {
        self.last_timestamp
    }

    /// Point the slot at `entity_id`. The ordering guard restarts with the
    /// new source.
    pub fn bind(&mut self, entity_id: impl Into<String>) {
        self.source = Some(entity_id.into());
        self.last_timestamp = None;
    }

    pub fn unbind(&mut self) {
        self.source = None;
        self.last_timestamp = None;
    }

    /// Gate an incoming callback. Equal timestamps are accepted.
    pub fn on_source_value(&mut self, entity_id: &str, timestamp: OffsetDateTime) -> BindingOutcome {
        let Some(bound) = self.source.as_deref() else {
            return BindingOutcome::Unbound;
        };
        if bound != entity_id {
            return BindingOutcome::WrongSource;
        }
        if self.last_timestamp.is_some_and(|last| timestamp < last) {
            return BindingOutcome::Regressed;
        }
        self.last_timestamp = Some(timestamp);
        BindingOutcome::Accepted
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

    const T0: OffsetDateTime = datetime!(2024-06-01 10:00 UTC);

    fn sources() -> HashMap<String, SourceState> {
        let mut map = HashMap::new();
        map.insert(
            "sensor.soil_a".to_string(),
            SourceState {
                value: Some(41.0),
                timestamp: T0,
            },
        );
        map.insert(
            "switch.pump".to_string(),
            SourceState {
                value: Some(1.0),
                timestamp: T0,
            },
        );
        map
    }

    #[test]
    fn unbound_drops_everything() {
        let mut b = SensorBinding::new(Slot::Moisture);
        assert_eq!(b.on_source_value("sensor.soil_a", T0), BindingOutcome::Unbound);
    }

    #[test]
    fn late_callback_from_replaced_source_dropped() {
        let mut b = SensorBinding::new(Slot::Moisture);
        b.bind("sensor.old");
        b.bind("sensor.new");
        assert_eq!(
            b.on_source_value("sensor.old", T0),
            BindingOutcome::WrongSource
        );
        assert_eq!(b.on_source_value("sensor.new", T0), BindingOutcome::Accepted);
    }

    #[test]
    fn regressed_timestamp_dropped() {
        let mut b = SensorBinding::new(Slot::Moisture);
        b.bind("sensor.soil_a");
        assert_eq!(b.on_source_value("sensor.soil_a", T0), BindingOutcome::Accepted);
        assert_eq!(
            b.on_source_value("sensor.soil_a", T0 - Duration::seconds(1)),
            BindingOutcome::Regressed
        );
        assert_eq!(b.on_source_value("sensor.soil_a", T0), BindingOutcome::Accepted);
        assert_eq!(b.last_timestamp(), Some(T0));
    }

    #[test]
    fn rebinding_resets_ordering_guard() {
        let mut b = SensorBinding::new(Slot::Moisture);
        b.bind("sensor.a");
        b.on_source_value("sensor.a", T0);
        b.bind("sensor.b");
        assert_eq!(
            b.on_source_value("sensor.b", T0 - Duration::hours(1)),
            BindingOutcome::Accepted
        );
    }

    #[test]
    fn resolve_requires_known_sensor_domain() {
        let map = sources();
        assert_eq!(resolve_source(&map, "sensor.soil_a").unwrap().value, Some(41.0));
        assert_eq!(
            resolve_source(&map, "switch.pump"),
            Err(DomainError::UnknownSource("switch.pump".into()))
        );
        assert!(resolve_source(&map, "sensor.missing").is_err());
    }
}
