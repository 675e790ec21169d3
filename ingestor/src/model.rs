use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One reading from one sensor at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub timestamp: DateTime<Utc>,
    pub measurement_type: String,
    pub sensor_index: i32,
    pub temp_external: i32,
    pub temp_internal: i32,
    pub battery_level: i32,
    pub data_points_count: i32,
    /// Spectral bins, parallel to `magnitude`.
    #[serde(default)]
    pub frequency: Vec<i32>,
    #[serde(default)]
    pub magnitude: Vec<i32>,
}

/// Events accumulated for one device, either in progress or completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventSeries {
    pub device_id: String,
    /// Timestamp of the first event in the series.
    pub timestamp: DateTime<Utc>,
    pub events: Vec<DeviceEvent>,
}

impl DeviceEventSeries {
    pub fn new(device_id: impl Into<String>, events: Vec<DeviceEvent>) -> Result<Self> {
        let timestamp = events
            .first()
            .map(|e| e.timestamp)
            .ok_or_else(|| Error::Validation("Event series cannot be empty".to_string()))?;

        Ok(Self {
            device_id: device_id.into(),
            timestamp,
            events,
        })
    }

    pub fn contains_sensor(&self, sensor_index: i32) -> bool {
        self.events.iter().any(|e| e.sensor_index == sensor_index)
    }

    /// Flattened read-model rows, one per event.
    pub fn rows(&self) -> impl Iterator<Item = DeviceEventRow> + '_ {
        self.events.iter().map(move |e| DeviceEventRow {
            timestamp: e.timestamp,
            device_id: self.device_id.clone(),
            measurement_type: e.measurement_type.clone(),
            sensor_index: e.sensor_index,
            temperature: e.temp_external,
            battery_level: e.battery_level,
            data_points_count: e.data_points_count,
        })
    }
}

/// Per-device counters. Only ever incremented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDevice {
    pub device_id: String,
    pub events_count: u64,
    pub messages_count: u64,
}

impl EdgeDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }
}

/// Device listing entry as served by the REST API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub events: Vec<DeviceEvent>,
}

impl From<DeviceEventSeries> for DeviceSnapshot {
    fn from(series: DeviceEventSeries) -> Self {
        Self {
            device_id: series.device_id,
            timestamp: series.timestamp,
            events: series.events,
        }
    }
}

impl From<DeviceSnapshot> for DeviceEventSeries {
    fn from(snapshot: DeviceSnapshot) -> Self {
        Self {
            device_id: snapshot.device_id,
            timestamp: snapshot.timestamp,
            events: snapshot.events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventRow {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub measurement_type: String,
    pub sensor_index: i32,
    pub temperature: i32,
    pub battery_level: i32,
    pub data_points_count: i32,
}

/// One page of flattened history rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventRowList {
    pub page_index: usize,
    pub page_size: usize,
    /// Matching rows before windowing.
    pub total_count: usize,
    pub search_start_timestamp: Option<DateTime<Utc>>,
    pub rows: Vec<DeviceEventRow>,
}

impl DeviceEventRowList {
    pub fn empty(page_index: usize, page_size: usize) -> Self {
        Self {
            page_index,
            page_size,
            total_count: 0,
            search_start_timestamp: None,
            rows: Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn event_at(millis: i64, sensor_index: i32) -> DeviceEvent {
        DeviceEvent {
            timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
            measurement_type: "vibration".to_string(),
            sensor_index,
            temp_external: 21,
            temp_internal: 30,
            battery_level: 3300,
            data_points_count: 2,
            frequency: vec![50, 100],
            magnitude: vec![7, 3],
        }
    }

    pub fn series(device_id: &str, events: Vec<DeviceEvent>) -> DeviceEventSeries {
        DeviceEventSeries::new(device_id, events).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_series_timestamp_is_first_event() {
        let s = series("dev1", vec![event_at(2_000, 1), event_at(1_000, 0)]);
        assert_eq!(s.timestamp, event_at(2_000, 1).timestamp);
        assert!(s.contains_sensor(0));
        assert!(!s.contains_sensor(5));
    }

    #[test]
    fn test_empty_series_rejected() {
        assert!(matches!(
            DeviceEventSeries::new("dev1", Vec::new()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rows_flatten_each_event() {
        let s = series("dev1", vec![event_at(1_000, 0), event_at(1_500, 1)]);
        let rows: Vec<_> = s.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sensor_index, 1);
        assert_eq!(rows[1].device_id, "dev1");
        assert_eq!(rows[0].temperature, 21);
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let json = serde_json::to_value(event_at(1_000, 3)).unwrap();
        assert_eq!(json["sensorIndex"], 3);
        assert_eq!(json["measurementType"], "vibration");
        assert!(json["timestamp"].as_str().unwrap().starts_with("1970-01-01T00:00:01"));
    }
}
