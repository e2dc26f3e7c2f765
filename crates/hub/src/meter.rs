//! Threshold evaluation for a single measurement slot.
//!
//! Values and bounds are stored in the slot's canonical unit. Temperature
//! meters additionally carry a display unit; every value crossing the API
//! boundary is converted on the way in and out, so switching the display
//! unit never rewrites what is stored.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DomainError;
use crate::slot::{Slot, Unit, UnitSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterStatus {
    Unknown,
    Low,
    Ok,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMeter {
    slot: Slot,
    current_value: Option<f64>,
    min_bound: f64,
    max_bound: f64,
    display_unit: Unit,
    problem_enabled: bool,
    problem: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_updated: Option<OffsetDateTime>,
}

impl ThresholdMeter {
    /// A meter with the slot's default bounds, no value, and problem
    /// evaluation enabled.
    pub fn new(slot: Slot, units: UnitSystem) -> Self {
        let (min_bound, max_bound) = slot.default_bounds();
        let display_unit = match slot {
            Slot::Temperature => units.temperature_unit().into(),
            _ => slot.canonical_unit(),
        };
        Self {
            slot,
            current_value: None,
            min_bound,
            max_bound,
            display_unit,
            problem_enabled: true,
            problem: false,
            last_updated: None,
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Current value in the canonical unit.
    pub fn value(&self) -> Option<f64> {
        self.current_value
    }

    pub fn display_value(&self) -> Option<f64> {
        self.current_value.map(|v| self.from_canonical(v))
    }

    /// (min, max) in the canonical unit.
    pub fn bounds(&self) -> (f64, f64) {
        (self.min_bound, self.max_bound)
    }

    pub fn display_bounds(&self) -> (f64, f64) {
        (
            self.from_canonical(self.min_bound),
            self.from_canonical(self.max_bound),
        )
    }

    pub fn display_unit(&self) -> Unit {
        self.display_unit
    }

    pub fn problem_enabled(&self) -> bool {
        self.problem_enabled
    }

    pub fn problem(&self) -> bool {
        self.problem
    }

    pub fn last_updated(&self) -> Option<OffsetDateTime> {
        self.last_updated
    }

    pub fn status(&self) -> MeterStatus {
        match self.current_value {
            None => MeterStatus::Unknown,
            Some(v) if v < self.min_bound => MeterStatus::Low,
            Some(v) if v > self.max_bound => MeterStatus::High,
            Some(_) => MeterStatus::Ok,
        }
    }

    // -- mutation -----------------------------------------------------------

    /// Record a new reading expressed in the display unit. Returns whether
    /// `problem` flipped.
    pub fn update_value(&mut self, value: f64, timestamp: OffsetDateTime) -> bool {
        let canonical = self.to_canonical(value);
        self.update_canonical(Some(canonical), timestamp)
    }

    /// Record a reading that is already in the canonical unit (aggregates and
    /// derived metrics). `None` forgets the value. A non-finite reading is
    /// treated like an unavailable source: the last value stays.
    pub fn update_canonical(&mut self, value: Option<f64>, timestamp: OffsetDateTime) -> bool {
        if value.is_some_and(|v| !v.is_finite()) {
            return false;
        }
        self.current_value = value;
        self.last_updated = Some(timestamp);
        self.recompute()
    }

    /// Forget the current value, e.g. when the slot is unbound.
    pub fn clear_value(&mut self) -> bool {
        self.current_value = None;
        self.last_updated = None;
        self.recompute()
    }

    /// Replace both bounds, given in the display unit.
    pub fn set_bounds(&mut self, min: f64, max: f64) -> Result<bool, DomainError> {
        check_bounds(self.slot, min, max)?;
        self.min_bound = self.to_canonical(min);
        self.max_bound = self.to_canonical(max);
        Ok(self.recompute())
    }

    /// Replace both bounds, given in the canonical unit.
    pub fn set_canonical_bounds(&mut self, min: f64, max: f64) -> Result<bool, DomainError> {
        check_bounds(self.slot, min, max)?;
        self.min_bound = min;
        self.max_bound = max;
        Ok(self.recompute())
    }

    /// Take over another meter's bounds and problem toggle. The reading
    /// stays as it is.
    pub fn copy_thresholds_from(&mut self, other: &ThresholdMeter) -> bool {
        self.min_bound = other.min_bound;
        self.max_bound = other.max_bound;
        self.problem_enabled = other.problem_enabled;
        self.recompute()
    }

    pub fn set_problem_enabled(&mut self, enabled: bool) -> bool {
        self.problem_enabled = enabled;
        self.recompute()
    }

    /// Switch the presentation unit of a temperature meter. Stored values
    /// are untouched.
    pub fn convert_unit(&mut self, new_unit: Unit) -> Result<(), DomainError> {
        if self.slot != Slot::Temperature || new_unit.temperature().is_none() {
            return Err(DomainError::UnitMismatch {
                slot: self.slot,
                unit: new_unit,
            });
        }
        self.display_unit = new_unit;
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    fn evaluate(&self) -> bool {
        self.problem_enabled
            && self
                .current_value
                .is_some_and(|v| v < self.min_bound || v > self.max_bound)
    }

    fn recompute(&mut self) -> bool {
        let next = self.evaluate();
        let changed = next != self.problem;
        self.problem = next;
        changed
    }

    fn to_canonical(&self, value: f64) -> f64 {
        match self.display_unit.temperature() {
            Some(unit) => unit.to_celsius(value),
            None => value,
        }
    }

    fn from_canonical(&self, value: f64) -> f64 {
        match self.display_unit.temperature() {
            Some(unit) => unit.from_celsius(value),
            None => value,
        }
    }
}

pub fn check_bounds(slot: Slot, min: f64, max: f64) -> Result<(), DomainError> {
    if !min.is_finite() || !max.is_finite() || min > max {
        return Err(DomainError::InvalidBounds { slot, min, max });
    }
    Ok(())
}

/// Presentation of a meter for the API, in its display unit.
#[derive(Debug, Clone, Serialize)]
pub struct MeterView {
    pub slot: Slot,
    pub value: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub unit: &'static str,
    pub status: MeterStatus,
    pub problem: bool,
    pub problem_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MeterView {
    pub fn new(meter: &ThresholdMeter, source: Option<&str>) -> Self {
        let (min, max) = meter.display_bounds();
        Self {
            slot: meter.slot(),
            value: meter.display_value(),
            min,
            max,
            unit: meter.display_unit().symbol(),
            status: meter.status(),
            problem: meter.problem(),
            problem_enabled: meter.problem_enabled(),
            source: source.map(str::to_string),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn moisture() -> ThresholdMeter {
        ThresholdMeter::new(Slot::Moisture, UnitSystem::Metric)
    }

    fn temperature(units: UnitSystem) -> ThresholdMeter {
        ThresholdMeter::new(Slot::Temperature, units)
    }

    // -- problem invariant --------------------------------------------------

    #[test]
    fn new_meter_has_no_problem() {
        let m = moisture();
        assert_eq!(m.value(), None);
        assert!(!m.problem());
        assert_eq!(m.status(), MeterStatus::Unknown);
    }

    #[test]
    fn value_below_min_raises_problem() {
        let mut m = moisture();
        assert!(m.update_value(10.0, T0));
        assert!(m.problem());
        assert_eq!(m.status(), MeterStatus::Low);
    }

    #[test]
    fn value_above_max_raises_problem() {
        let mut m = moisture();
        m.update_value(75.0, T0);
        assert!(m.problem());
        assert_eq!(m.status(), MeterStatus::High);
    }

    #[test]
    fn value_on_bound_is_ok() {
        let mut m = moisture();
        assert!(!m.update_value(20.0, T0));
        assert!(!m.problem());
        assert!(!m.update_value(60.0, T0));
        assert!(!m.problem());
        assert_eq!(m.status(), MeterStatus::Ok);
    }

    #[test]
    fn update_reports_only_flips() {
        let mut m = moisture();
        assert!(m.update_value(5.0, T0));
        assert!(!m.update_value(6.0, T0), "still a problem, no flip");
        assert!(m.update_value(30.0, T0));
    }

    #[test]
    fn disabling_clears_problem_but_keeps_value() {
        let mut m = moisture();
        m.update_value(5.0, T0);
        assert!(m.set_problem_enabled(false));
        assert!(!m.problem());
        assert_eq!(m.value(), Some(5.0));
        assert_eq!(m.status(), MeterStatus::Low);

        assert!(m.set_problem_enabled(true));
        assert!(m.problem());
    }

    #[test]
    fn clear_value_clears_problem() {
        let mut m = moisture();
        m.update_value(5.0, T0);
        assert!(m.clear_value());
        assert!(!m.problem());
        assert_eq!(m.last_updated(), None);
    }

    #[test]
    fn non_finite_reading_is_unknown() {
        let mut m = moisture();
        m.update_value(f64::NAN, T0);
        assert_eq!(m.value(), None);
        assert!(!m.problem());
    }

    #[test]
    fn non_finite_reading_keeps_last_value() {
        let mut m = moisture();
        m.update_value(5.0, T0);
        let later = T0 + time::Duration::minutes(1);
        assert!(!m.update_value(f64::INFINITY, later));
        assert!(!m.update_canonical(Some(f64::NAN), later));
        assert_eq!(m.value(), Some(5.0));
        assert_eq!(m.last_updated(), Some(T0));
        assert!(m.problem());
    }

    // -- bounds -------------------------------------------------------------

    #[test]
    fn set_bounds_recomputes() {
        let mut m = moisture();
        m.update_value(30.0, T0);
        assert_eq!(m.set_bounds(35.0, 80.0), Ok(true));
        assert!(m.problem());
    }

    #[test]
    fn inverted_bounds_rejected_without_change() {
        let mut m = moisture();
        let err = m.set_bounds(70.0, 20.0).unwrap_err();
        assert!(matches!(err, DomainError::InvalidBounds { .. }));
        assert_eq!(m.bounds(), (20.0, 60.0));
    }

    #[test]
    fn equal_bounds_accepted() {
        let mut m = moisture();
        m.set_bounds(40.0, 40.0).unwrap();
        assert_eq!(m.bounds(), (40.0, 40.0));
    }

    #[test]
    fn nan_bounds_rejected() {
        let mut m = moisture();
        assert!(m.set_bounds(f64::NAN, 40.0).is_err());
    }

    // -- temperature units ----------------------------------------------------

    #[test]
    fn ten_celsius_bound_reads_fifty_fahrenheit() {
        let mut m = temperature(UnitSystem::Metric);
        assert_eq!(m.display_bounds().0, 10.0);
        m.convert_unit(Unit::Fahrenheit).unwrap();
        assert_eq!(m.display_bounds().0, 50.0);
        assert_eq!(m.bounds().0, 10.0);
    }

    #[test]
    fn repeated_conversion_does_not_drift() {
        let mut m = temperature(UnitSystem::Metric);
        for _ in 0..10 {
            m.convert_unit(Unit::Fahrenheit).unwrap();
            m.convert_unit(Unit::Celsius).unwrap();
        }
        assert_eq!(m.display_bounds(), (10.0, 40.0));
    }

    #[test]
    fn fahrenheit_readings_compare_against_celsius_bounds() {
        let mut m = temperature(UnitSystem::Imperial);
        // 104°F == 40°C, right on the max bound.
        m.update_value(104.0, T0);
        assert!(!m.problem());
        m.update_value(105.0, T0);
        assert!(m.problem());
        assert_eq!(m.display_value(), Some(105.0));
    }

    #[test]
    fn fahrenheit_bounds_are_stored_canonically() {
        let mut m = temperature(UnitSystem::Imperial);
        m.set_bounds(50.0, 104.0).unwrap();
        assert_eq!(m.bounds(), (10.0, 40.0));
    }

    #[test]
    fn convert_unit_rejected_for_other_slots() {
        let mut m = moisture();
        assert!(matches!(
            m.convert_unit(Unit::Fahrenheit),
            Err(DomainError::UnitMismatch { .. })
        ));
        let mut t = temperature(UnitSystem::Metric);
        assert!(t.convert_unit(Unit::Lux).is_err());
    }

    #[test]
    fn snapshot_roundtrip_keeps_state() {
        let mut m = temperature(UnitSystem::Imperial);
        m.update_value(120.0, T0);
        let json = serde_json::to_string(&m).unwrap();
        let back: ThresholdMeter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    // -- properties -----------------------------------------------------------

    proptest! {
        #[test]
        fn problem_matches_invariant(
            value in proptest::option::of(-100.0f64..200.0),
            a in -100.0f64..200.0,
            b in -100.0f64..200.0,
            enabled in any::<bool>(),
        ) {
            let (min, max) = if a <= b { (a, b) } else { (b, a) };
            let mut m = moisture();
            m.set_bounds(min, max).unwrap();
            m.set_problem_enabled(enabled);
            match value {
                Some(v) => { m.update_value(v, T0); }
                None => { m.clear_value(); }
            }
            let expected = enabled && value.is_some_and(|v| v < min || v > max);
            prop_assert_eq!(m.problem(), expected);
        }

        #[test]
        fn unit_toggling_never_moves_canonical_bounds(
            min in -40.0f64..20.0,
            span in 0.0f64..40.0,
            rounds in 1usize..20,
        ) {
            let mut m = temperature(UnitSystem::Metric);
            m.set_bounds(min, min + span).unwrap();
            let stored = m.bounds();
            for _ in 0..rounds {
                m.convert_unit(Unit::Fahrenheit).unwrap();
                m.convert_unit(Unit::Celsius).unwrap();
            }
            prop_assert_eq!(m.bounds(), stored);
        }
    }
}
