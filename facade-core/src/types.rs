//! Type definitions for readings, scoring payloads and result records

use crate::SENSOR_COUNT;
use chrono::{DateTime, Utc};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Machine identifier
pub type MachineId = i64;

/// One sensor snapshot emitted by a machine.
///
/// On the wire a reading is a flat object: `machine_id` plus `sensor_00` ..
/// `sensor_51`. Sensors absent from the payload (or sent as `null`) read as
/// `0.0`, unknown keys are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Emitting machine
    pub machine_id: MachineId,
    /// Feature values in sensor order
    pub sensors: [f64; SENSOR_COUNT],
}

impl Reading {
    /// Reading with every feature set to zero
    pub fn zeroed(machine_id: MachineId) -> Self {
        Self {
            machine_id,
            sensors: [0.0; SENSOR_COUNT],
        }
    }

    /// Feature vector in sensor order
    pub fn features(&self) -> &[f64] {
        &self.sensors
    }
}

/// Wire name of sensor `index`
pub fn sensor_key(index: usize) -> String {
    format!("sensor_{:02}", index)
}

fn sensor_index(key: &str) -> Option<usize> {
    let digits = key.strip_prefix("sensor_")?;
    if digits.len() != 2 {
        return None;
    }
    digits.parse::<usize>().ok().filter(|i| *i < SENSOR_COUNT)
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(SENSOR_COUNT + 1))?;
        map.serialize_entry("machine_id", &self.machine_id)?;
        for (i, value) in self.sensors.iter().enumerate() {
            map.serialize_entry(&sensor_key(i), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Reading {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ReadingVisitor;

        impl<'de> Visitor<'de> for ReadingVisitor {
            type Value = Reading;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sensor reading object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Reading, A::Error> {
                let mut machine_id = None;
                let mut sensors = [0.0; SENSOR_COUNT];

                while let Some(key) = map.next_key::<String>()? {
                    if key == "machine_id" {
                        if machine_id.is_some() {
                            return Err(de::Error::duplicate_field("machine_id"));
                        }
                        machine_id = Some(map.next_value::<MachineId>()?);
                    } else if let Some(index) = sensor_index(&key) {
                        sensors[index] = map.next_value::<Option<f64>>()?.unwrap_or(0.0);
                    } else {
                        map.next_value::<de::IgnoredAny>()?;
                    }
                }

                let machine_id = machine_id.ok_or_else(|| de::Error::missing_field("machine_id"))?;
                Ok(Reading {
                    machine_id,
                    sensors,
                })
            }
        }

        deserializer.deserialize_map(ReadingVisitor)
    }
}

/// Request body sent to the remote scorer
#[derive(Debug, Serialize)]
pub struct ScoringRequest<'a> {
    /// One feature vector per reading, in batch order
    pub input_values: Vec<&'a [f64]>,
}

impl<'a> ScoringRequest<'a> {
    /// Project a batch of readings into the scorer payload
    pub fn from_readings(readings: &'a [Reading]) -> Self {
        Self {
            input_values: readings.iter().map(Reading::features).collect(),
        }
    }

    /// Number of vectors in the request
    pub fn len(&self) -> usize {
        self.input_values.len()
    }

    /// True when the request carries no vectors
    pub fn is_empty(&self) -> bool {
        self.input_values.is_empty()
    }
}

/// Response body of the remote scorer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResponse {
    /// One reconstruction error per request vector
    pub reconstruction_errors: Vec<f64>,
}

/// Ingestion path a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Synchronous HTTP request
    Api,
    /// Streamed broker delivery
    Queue,
}

impl Origin {
    /// Tag persisted with the record
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Api => "api",
            Origin::Queue => "queue",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for a single reading, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    /// Scored reading
    pub reading: Reading,
    /// Scorer output for the reading
    pub reconstruction_error: f64,
    /// Error strictly above the machine threshold
    pub anomaly: bool,
    /// Counter value produced by this decision
    pub anomaly_counter: i64,
    /// Ingestion path
    pub origin: Origin,
}

/// Identity assigned by the record sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    /// Store-assigned id
    pub id: i64,
    /// Store-assigned creation time
    pub created_at: DateTime<Utc>,
}

/// Threshold-set request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    /// Target machine
    pub machine_id: MachineId,
    /// New threshold
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reading_from_flat_object() {
        let payload = json!({
            "machine_id": 7,
            "sensor_00": 0.1,
            "sensor_51": 5.2,
            "machine_status": "NORMAL"
        });

        let reading: Reading = serde_json::from_value(payload).unwrap();
        assert_eq!(reading.machine_id, 7);
        assert_eq!(reading.sensors[0], 0.1);
        assert_eq!(reading.sensors[51], 5.2);
        assert_eq!(reading.sensors[25], 0.0);
    }

    #[test]
    fn test_null_sensor_reads_as_zero() {
        let reading: Reading =
            serde_json::from_str(r#"{"machine_id": 1, "sensor_15": null}"#).unwrap();
        assert_eq!(reading.sensors[15], 0.0);
    }

    #[test]
    fn test_missing_machine_id_rejected() {
        let result = serde_json::from_str::<Reading>(r#"{"sensor_00": 1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_sensor_ignored() {
        let reading: Reading =
            serde_json::from_str(r#"{"machine_id": 1, "sensor_52": 9.0, "sensor_5": 3.0}"#)
                .unwrap();
        assert!(reading.sensors.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_reading_serializes_flat() {
        let mut reading = Reading::zeroed(3);
        reading.sensors[4] = 1.5;

        let value = serde_json::to_value(&reading).unwrap();
        assert_eq!(value["machine_id"], 3);
        assert_eq!(value["sensor_04"], 1.5);
        assert_eq!(value.as_object().unwrap().len(), SENSOR_COUNT + 1);
    }

    #[test]
    fn test_scoring_request_shape() {
        let readings = vec![Reading::zeroed(1), Reading::zeroed(2)];
        let request = ScoringRequest::from_readings(&readings);

        let value = serde_json::to_value(&request).unwrap();
        let vectors = value["input_values"].as_array().unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].as_array().unwrap().len(), SENSOR_COUNT);
    }

    #[test]
    fn test_origin_tags() {
        assert_eq!(Origin::Api.as_str(), "api");
        assert_eq!(Origin::Queue.to_string(), "queue");
    }
}
