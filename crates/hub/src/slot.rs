//! Measurement slots and the units they are stored and presented in.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// One physical measurement category tracked per plant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Temperature,
    Moisture,
    Conductivity,
    Illuminance,
    Humidity,
    PowerConsumption,
    Ph,
    Dli,
}

impl Slot {
    pub const ALL: [Slot; 8] = [
        Slot::Temperature,
        Slot::Moisture,
        Slot::Conductivity,
        Slot::Illuminance,
        Slot::Humidity,
        Slot::PowerConsumption,
        Slot::Ph,
        Slot::Dli,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Temperature => "temperature",
            Slot::Moisture => "moisture",
            Slot::Conductivity => "conductivity",
            Slot::Illuminance => "illuminance",
            Slot::Humidity => "humidity",
            Slot::PowerConsumption => "power_consumption",
            Slot::Ph => "ph",
            Slot::Dli => "dli",
        }
    }

    /// Whether the slot is fed by an external sensor binding. `dli` is
    /// derived from the illuminance binding instead.
    pub fn is_sourced(self) -> bool {
        self != Slot::Dli
    }

    /// Unit the slot's values and bounds are stored in.
    pub fn canonical_unit(self) -> Unit {
        match self {
            Slot::Temperature => Unit::Celsius,
            Slot::Moisture | Slot::Humidity => Unit::Percent,
            Slot::Conductivity => Unit::MicroSiemensPerCm,
            Slot::Illuminance => Unit::Lux,
            Slot::PowerConsumption => Unit::Watt,
            Slot::Ph => Unit::Ph,
            Slot::Dli => Unit::MolPerDaySquareMeter,
        }
    }

    /// Default (min, max) bounds in the canonical unit.
    pub fn default_bounds(self) -> (f64, f64) {
        match self {
            Slot::Temperature => (10.0, 40.0),
            Slot::Moisture => (20.0, 60.0),
            Slot::Conductivity => (500.0, 3000.0),
            Slot::Illuminance => (0.0, 100_000.0),
            Slot::Humidity => (20.0, 60.0),
            Slot::PowerConsumption => (0.1, 5.0),
            Slot::Ph => (5.5, 7.5),
            Slot::Dli => (2.0, 30.0),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Slot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == wanted)
            .ok_or_else(|| format!("unknown measurement slot '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Percent,
    MicroSiemensPerCm,
    Lux,
    Watt,
    Ph,
    MolPerDaySquareMeter,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::Fahrenheit => "°F",
            Unit::Percent => "%",
            Unit::MicroSiemensPerCm => "μS/cm",
            Unit::Lux => "lx",
            Unit::Watt => "W",
            Unit::Ph => "pH",
            Unit::MolPerDaySquareMeter => "mol/d⋅m²",
        }
    }

    pub fn temperature(self) -> Option<TemperatureUnit> {
        match self {
            Unit::Celsius => Some(TemperatureUnit::Celsius),
            Unit::Fahrenheit => Some(TemperatureUnit::Fahrenheit),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Express a Celsius value in this unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }

    /// Express a value given in this unit in Celsius.
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }
}

impl From<TemperatureUnit> for Unit {
    fn from(unit: TemperatureUnit) -> Self {
        match unit {
            TemperatureUnit::Celsius => Unit::Celsius,
            TemperatureUnit::Fahrenheit => Unit::Fahrenheit,
        }
    }
}

/// The host's global unit preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl UnitSystem {
    pub fn temperature_unit(self) -> TemperatureUnit {
        match self {
            UnitSystem::Metric => TemperatureUnit::Celsius,
            UnitSystem::Imperial => TemperatureUnit::Fahrenheit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitSystem::Metric => "metric",
            UnitSystem::Imperial => "imperial",
        }
    }
}

impl FromStr for UnitSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metric" => Ok(UnitSystem::Metric),
            "imperial" => Ok(UnitSystem::Imperial),
            other => Err(format!("unknown unit system '{other}' (use metric/imperial)")),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_parses_from_its_name() {
        for slot in Slot::ALL {
            assert_eq!(slot.as_str().parse::<Slot>().unwrap(), slot);
        }
        assert_eq!(" Power_Consumption ".parse::<Slot>().unwrap(), Slot::PowerConsumption);
        assert!("soil".parse::<Slot>().is_err());
    }

    #[test]
    fn slot_serializes_snake_case() {
        let json = serde_json::to_string(&Slot::PowerConsumption).unwrap();
        assert_eq!(json, "\"power_consumption\"");
    }

    #[test]
    fn only_dli_is_derived() {
        let derived: Vec<_> = Slot::ALL.into_iter().filter(|s| !s.is_sourced()).collect();
        assert_eq!(derived, vec![Slot::Dli]);
    }

    #[test]
    fn ten_celsius_is_fifty_fahrenheit() {
        assert_eq!(TemperatureUnit::Fahrenheit.from_celsius(10.0), 50.0);
        assert_eq!(TemperatureUnit::Fahrenheit.to_celsius(50.0), 10.0);
        assert_eq!(TemperatureUnit::Celsius.from_celsius(10.0), 10.0);
    }

    #[test]
    fn default_bounds_are_ordered() {
        for slot in Slot::ALL {
            let (min, max) = slot.default_bounds();
            assert!(min <= max, "{slot}: {min} > {max}");
        }
    }

    #[test]
    fn unit_system_parse() {
        assert_eq!("Imperial".parse::<UnitSystem>().unwrap(), UnitSystem::Imperial);
        assert_eq!(
            UnitSystem::Imperial.temperature_unit(),
            TemperatureUnit::Fahrenheit
        );
        assert!("kelvin".parse::<UnitSystem>().is_err());
    }
}
