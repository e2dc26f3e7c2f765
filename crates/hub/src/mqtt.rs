use serde::Deserialize;
use time::OffsetDateTime;

use crate::binding::SENSOR_DOMAIN;
use crate::command::Command;

pub(crate) const SENSOR_TOPIC_FILTER: &str = "sensor/+/state";
pub(crate) const CMD_TOPIC: &str = "plant/cmd";
pub(crate) const CMD_RESULT_TOPIC: &str = "plant/cmd/result";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// `{"value": 21.5, "ts": 1717236000}`. A null or missing value means the
/// sensor is unavailable; a missing ts means "now".
#[derive(Debug, Deserialize)]
pub(crate) struct SensorMsg {
    #[serde(default)]
    pub(crate) value: Option<f64>,
    #[serde(default)]
    pub(crate) ts: Option<i64>,
}

impl SensorMsg {
    pub(crate) fn timestamp(&self, now: OffsetDateTime) -> Result<OffsetDateTime, String> {
        match self.ts {
            None => Ok(now),
            Some(ts) => OffsetDateTime::from_unix_timestamp(ts)
                .map_err(|e| format!("bad sensor timestamp {ts}: {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Map "sensor/<object>/state" to the entity id "sensor.<object>".
pub(crate) fn extract_sensor_entity(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "sensor" && parts[2] == "state" && !parts[1].is_empty() {
        Some(format!("{SENSOR_DOMAIN}{}", parts[1]))
    } else {
        None
    }
}

/// Parse a sensor payload. Besides JSON, a bare number or the literals
/// "unavailable"/"unknown" are accepted.
pub(crate) fn parse_sensor_payload(payload: &[u8]) -> Result<SensorMsg, String> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("unavailable") || trimmed.eq_ignore_ascii_case("unknown") {
        return Ok(SensorMsg {
            value: None,
            ts: None,
        });
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return Ok(SensorMsg {
            value: value.is_finite().then_some(value),
            ts: None,
        });
    }
    serde_json::from_str(trimmed).map_err(|e| format!("bad sensor json: {e}"))
}

pub(crate) fn parse_command(payload: &[u8]) -> Result<Command, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad command json: {e}"))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::Slot;
    use time::macros::datetime;

    // -- extract_sensor_entity ----------------------------------------------

    #[test]
    fn extract_sensor_entity_valid_topic() {
        assert_eq!(
            extract_sensor_entity("sensor/soil_1/state").as_deref(),
            Some("sensor.soil_1")
        );
    }

    #[test]
    fn extract_sensor_entity_wrong_prefix() {
        assert_eq!(extract_sensor_entity("switch/pump/state"), None);
    }

    #[test]
    fn extract_sensor_entity_wrong_suffix() {
        assert_eq!(extract_sensor_entity("sensor/soil_1/attributes"), None);
    }

    #[test]
    fn extract_sensor_entity_too_few_segments() {
        assert_eq!(extract_sensor_entity("sensor/state"), None);
    }

    #[test]
    fn extract_sensor_entity_too_many_segments() {
        assert_eq!(extract_sensor_entity("sensor/a/b/state"), None);
    }

    #[test]
    fn extract_sensor_entity_empty_object() {
        assert_eq!(extract_sensor_entity("sensor//state"), None);
    }

    // -- parse_sensor_payload ------------------------------------------------

    #[test]
    fn sensor_json_with_ts() {
        let msg = parse_sensor_payload(br#"{"value": 21.5, "ts": 1717236000}"#).unwrap();
        assert_eq!(msg.value, Some(21.5));
        assert_eq!(
            msg.timestamp(OffsetDateTime::UNIX_EPOCH).unwrap(),
            datetime!(2024-06-01 10:00 UTC)
        );
    }

    #[test]
    fn sensor_json_null_value_is_unavailable() {
        let msg = parse_sensor_payload(br#"{"value": null}"#).unwrap();
        assert_eq!(msg.value, None);
        let now = datetime!(2024-06-01 12:00 UTC);
        assert_eq!(msg.timestamp(now).unwrap(), now);
    }

    #[test]
    fn sensor_bare_number() {
        let msg = parse_sensor_payload(b" 42.0\n").unwrap();
        assert_eq!(msg.value, Some(42.0));
    }

    #[test]
    fn sensor_unavailable_literal() {
        assert_eq!(parse_sensor_payload(b"unavailable").unwrap().value, None);
        assert_eq!(parse_sensor_payload(b"UNKNOWN").unwrap().value, None);
    }

    #[test]
    fn sensor_nan_is_unavailable() {
        assert_eq!(parse_sensor_payload(b"NaN").unwrap().value, None);
    }

    #[test]
    fn sensor_garbage_rejected() {
        let err = parse_sensor_payload(b"{value").unwrap_err();
        assert!(err.starts_with("bad sensor json"));
    }

    #[test]
    fn sensor_ts_out_of_range_rejected() {
        let msg = parse_sensor_payload(br#"{"value": 1, "ts": 9223372036854775807}"#).unwrap();
        assert!(msg.timestamp(OffsetDateTime::UNIX_EPOCH).is_err());
    }

    // -- parse_command -------------------------------------------------------

    #[test]
    fn parse_command_replace_sensor() {
        let cmd = parse_command(
            br#"{"op": "replace_sensor", "plant": "basil", "slot": "moisture", "source": "sensor.soil_1"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::ReplaceSensor {
                plant: "basil".into(),
                slot: Slot::Moisture,
                source: Some("sensor.soil_1".into()),
            }
        );
    }

    #[test]
    fn parse_command_unknown_op() {
        let err = parse_command(br#"{"op": "water_now"}"#).unwrap_err();
        assert!(err.starts_with("bad command json"));
    }
}
