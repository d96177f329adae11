//! Wire payloads exchanged between devices, nodes and the gateway
//!
//! Inbound sensor readings are accepted in both the PascalCase layout devices
//! publish (`{"Id":1,"Type":1,"Value":21.5,...}`) and camelCase. Everything
//! the pipeline emits is camelCase JSON.

use crate::error::ProcessingError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical quantity a sensor measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Temperature,
    Humidity,
    SoilMoisture,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::SoilMoisture,
    ];

    /// Numeric code used by device firmware
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Temperature),
            2 => Some(Self::Humidity),
            3 => Some(Self::SoilMoisture),
            _ => None,
        }
    }

    /// Accepts `temperature`, `Temperature`, `soil_moisture`, `SoilMoisture`, ...
    pub fn from_config_key(key: &str) -> Option<Self> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .into_iter()
            .find(|kind| kind.topic_segment() == normalized)
    }

    /// Display name carried in payloads
    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "Temperature",
            Self::Humidity => "Humidity",
            Self::SoilMoisture => "SoilMoisture",
        }
    }

    /// Lower-case form used when building topic reasons
    pub fn topic_segment(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::SoilMoisture => "soilmoisture",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sensor kind as decoded from a payload
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingKind {
    Known(SensorKind),
    Unrecognized(String),
}

impl ReadingKind {
    pub fn known(&self) -> Option<SensorKind> {
        match self {
            Self::Known(kind) => Some(*kind),
            Self::Unrecognized(_) => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Known(kind) => kind.name().to_string(),
            Self::Unrecognized(raw) => raw.clone(),
        }
    }
}

/// Decoded device reading
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub device_id: i64,
    pub name: String,
    pub kind: ReadingKind,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KindField {
    Code(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct RawSensorReading {
    #[serde(alias = "Id", alias = "deviceId", alias = "DeviceId")]
    id: i64,
    #[serde(default, alias = "Name")]
    name: String,
    #[serde(
        rename = "type",
        alias = "Type",
        alias = "sensorType",
        alias = "SensorType"
    )]
    kind: KindField,
    #[serde(alias = "Value")]
    value: f64,
    #[serde(default, alias = "Timestamp")]
    timestamp: Option<String>,
    #[serde(default, alias = "Location")]
    location: String,
    #[serde(default, alias = "Unit")]
    unit: String,
}

impl SensorReading {
    /// Decode a device payload; a missing or unparsable timestamp falls back to `received_at`
    pub fn decode(
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Self, ProcessingError> {
        let raw: RawSensorReading =
            serde_json::from_slice(payload).map_err(|e| ProcessingError::decode(topic, e))?;

        let kind = match raw.kind {
            KindField::Code(code) => SensorKind::from_code(code)
                .map(ReadingKind::Known)
                .unwrap_or_else(|| ReadingKind::Unrecognized(code.to_string())),
            KindField::Name(name) => SensorKind::from_config_key(&name)
                .map(ReadingKind::Known)
                .unwrap_or(ReadingKind::Unrecognized(name)),
        };

        let timestamp = raw
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        Ok(Self {
            device_id: raw.id,
            name: raw.name,
            kind,
            value: raw.value,
            unit: raw.unit,
            timestamp,
            location: raw.location,
        })
    }
}

/// Parse RFC 3339 timestamps, and offset-less ones as UTC
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Alert or clearance notification, published on both the alert and command topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertNotification {
    pub device_id: i64,
    pub sensor_type: String,
    /// `high_threshold`, `low_threshold_cleared`, `high_threshold_agg`, ...
    pub alert: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Windowed summary published for the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    pub device_id: i64,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    pub aggregation_window_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl AggregateReport {
    /// False when every aggregate field was disabled
    pub fn has_fields(&self) -> bool {
        self.average.is_some()
            || self.minimum.is_some()
            || self.maximum.is_some()
            || self.count.is_some()
    }
}

/// Body POSTed upstream by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardEnvelope {
    pub device_id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 26, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_decode_device_layout() {
        let payload = br#"{"Id":7,"Name":"probe","Type":1,"Value":21.5,"Timestamp":"2025-04-26T11:21:20Z","Location":"greenhouse","Unit":"C"}"#;

        let reading = SensorReading::decode("devices/7/data", payload, received_at()).unwrap();

        assert_eq!(reading.device_id, 7);
        assert_eq!(reading.kind, ReadingKind::Known(SensorKind::Temperature));
        assert_eq!(reading.value, 21.5);
        assert_eq!(reading.location, "greenhouse");
        assert_eq!(
            reading.timestamp,
            Utc.with_ymd_and_hms(2025, 4, 26, 11, 21, 20).unwrap()
        );
    }

    #[test]
    fn test_decode_camel_case_with_kind_name() {
        let payload = br#"{"deviceId":3,"sensorType":"soil_moisture","value":41.0}"#;

        let reading = SensorReading::decode("devices/3/data", payload, received_at()).unwrap();

        assert_eq!(reading.kind, ReadingKind::Known(SensorKind::SoilMoisture));
        assert_eq!(reading.timestamp, received_at());
        assert!(reading.unit.is_empty());
    }

    #[test]
    fn test_decode_unknown_kind_code() {
        let payload = br#"{"Id":3,"Type":9,"Value":1.0}"#;

        let reading = SensorReading::decode("devices/3/data", payload, received_at()).unwrap();

        assert_eq!(reading.kind, ReadingKind::Unrecognized("9".to_string()));
        assert_eq!(reading.kind.known(), None);
    }

    #[test]
    fn test_decode_malformed_payload() {
        let result = SensorReading::decode("devices/1/data", b"\xff\xfe not json", received_at());

        let error = result.unwrap_err();
        assert!(error.is_decode());
    }

    #[test]
    fn test_decode_missing_value_is_error() {
        let result = SensorReading::decode("devices/1/data", br#"{"Id":1,"Type":1}"#, received_at());
        assert!(result.is_err());
    }

    #[test]
    fn test_offset_less_timestamp_is_utc() {
        let parsed = parse_timestamp("2025-04-26T11:21:20.1234567").unwrap();
        assert_eq!(parsed.timestamp(), 1_745_666_480);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_kind_config_keys() {
        assert_eq!(
            SensorKind::from_config_key("SoilMoisture"),
            Some(SensorKind::SoilMoisture)
        );
        assert_eq!(
            SensorKind::from_config_key("soil_moisture"),
            Some(SensorKind::SoilMoisture)
        );
        assert_eq!(
            SensorKind::from_config_key("HUMIDITY"),
            Some(SensorKind::Humidity)
        );
        assert_eq!(SensorKind::from_config_key("pressure"), None);
    }

    #[test]
    fn test_alert_payload_omits_absent_fields() {
        let cleared = AlertNotification {
            device_id: 1,
            sensor_type: "Temperature".to_string(),
            alert: "high_threshold_cleared".to_string(),
            value: None,
            threshold: None,
            timestamp: received_at(),
        };

        let json = serde_json::to_value(&cleared).unwrap();
        assert_eq!(json["deviceId"], 1);
        assert_eq!(json["alert"], "high_threshold_cleared");
        assert!(json.get("value").is_none());
        assert!(json.get("threshold").is_none());
    }

    #[test]
    fn test_aggregate_report_field_selection() {
        let report = AggregateReport {
            device_id: 1,
            sensor_type: "Humidity".to_string(),
            timestamp: received_at(),
            aggregation_window_seconds: 60,
            average: None,
            minimum: None,
            maximum: None,
            count: None,
        };
        assert!(!report.has_fields());

        let with_count = AggregateReport {
            count: Some(3),
            ..report
        };
        let json = serde_json::to_value(&with_count).unwrap();
        assert_eq!(json["count"], 3);
        assert_eq!(json["aggregationWindowSeconds"], 60);
        assert!(json.get("average").is_none());
    }
}
