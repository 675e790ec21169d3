use crate::errors::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingestor::model::DeviceSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const BATTERY_MAX: i32 = 4000;
pub const BATTERY_MIN: i32 = 0;
pub const BATTERY_TARGET: i32 = 3200;
pub const BATTERY_PERCENTAGE_MAX: i32 = 100;
pub const BATTERY_PERCENTAGE_MIN: i32 = 0;
pub const BATTERY_PERCENTAGE_TARGET: i32 = 15;
pub const TEMPERATURE_MAX: i32 = 200;
pub const TEMPERATURE_MIN: i32 = -55;
pub const TEMPERATURE_TARGET: i32 = 55;

/// One spectral bin of one event, with the dashboard's threshold constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReportRecord {
    pub report_unique_id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub battery_level: i32,
    pub battery_voltage: i32,
    pub battery_max: i32,
    pub battery_min: i32,
    pub battery_target: i32,
    pub battery_percentage: i32,
    pub battery_percentage_max: i32,
    pub battery_percentage_min: i32,
    pub battery_percentage_target: i32,
    pub temperature: i32,
    pub temperature_max: i32,
    pub temperature_min: i32,
    pub temperature_target: i32,
    pub data_points_count: i32,
    pub measurement_type: String,
    pub sensor_index: i32,
    pub frequency: i32,
    pub magnitude: i32,
}

fn battery_percentage(level: i32) -> i32 {
    let clamped = level.clamp(BATTERY_MIN, BATTERY_MAX);
    (clamped - BATTERY_MIN) * BATTERY_PERCENTAGE_MAX / (BATTERY_MAX - BATTERY_MIN)
}

/// Flattens series into one record per (event, frequency bin). Records carry
/// the series timestamp.
pub fn flatten(report_id: &str, snapshots: &[DeviceSnapshot]) -> Vec<DeviceReportRecord> {
    let mut records = Vec::new();

    for snapshot in snapshots {
        for event in &snapshot.events {
            for (frequency, magnitude) in event.frequency.iter().zip(&event.magnitude) {
                records.push(DeviceReportRecord {
                    report_unique_id: report_id.to_string(),
                    timestamp: snapshot.timestamp,
                    device_id: snapshot.device_id.clone(),
                    battery_level: event.battery_level,
                    battery_voltage: 0,
                    battery_max: BATTERY_MAX,
                    battery_min: BATTERY_MIN,
                    battery_target: BATTERY_TARGET,
                    battery_percentage: battery_percentage(event.battery_level),
                    battery_percentage_max: BATTERY_PERCENTAGE_MAX,
                    battery_percentage_min: BATTERY_PERCENTAGE_MIN,
                    battery_percentage_target: BATTERY_PERCENTAGE_TARGET,
                    temperature: event.temp_external,
                    temperature_max: TEMPERATURE_MAX,
                    temperature_min: TEMPERATURE_MIN,
                    temperature_target: TEMPERATURE_TARGET,
                    data_points_count: event.data_points_count,
                    measurement_type: event.measurement_type.clone(),
                    sensor_index: event.sensor_index,
                    frequency: *frequency,
                    magnitude: *magnitude,
                });
            }
        }
    }

    records
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportPublisher: Send + Sync {
    async fn publish(&self, records: &[DeviceReportRecord]) -> Result<()>;
}

/// Posts records as a JSON array to a push endpoint.
pub struct HttpReportPublisher {
    http: reqwest::Client,
    url: String,
}

impl HttpReportPublisher {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ReportPublisher for HttpReportPublisher {
    async fn publish(&self, records: &[DeviceReportRecord]) -> Result<()> {
        debug!("Publishing {} report records to {}", records.len(), self.url);

        let response = self.http.post(&self.url).json(records).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Publish(format!("HTTP {}: {}", status, body)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ingestor::model::DeviceEvent;

    fn event(sensor_index: i32, frequency: Vec<i32>, magnitude: Vec<i32>) -> DeviceEvent {
        DeviceEvent {
            timestamp: Utc.timestamp_millis_opt(2_000).unwrap(),
            measurement_type: "vibration".to_string(),
            sensor_index,
            temp_external: 25,
            temp_internal: 40,
            battery_level: 3200,
            data_points_count: frequency.len() as i32,
            frequency,
            magnitude,
        }
    }

    #[test]
    fn test_flatten_one_record_per_bin() {
        let snapshot = DeviceSnapshot {
            device_id: "dev1".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_000).unwrap(),
            events: vec![event(0, vec![10, 20], vec![1, 2]), event(1, vec![30], vec![3])],
        };

        let records = flatten("report-1", &[snapshot]);
        assert_eq!(records.len(), 3);

        let bins: Vec<_> = records.iter().map(|r| (r.sensor_index, r.frequency, r.magnitude)).collect();
        assert_eq!(bins, vec![(0, 10, 1), (0, 20, 2), (1, 30, 3)]);

        let first = &records[0];
        assert_eq!(first.report_unique_id, "report-1");
        assert_eq!(first.timestamp.timestamp_millis(), 1_000);
        assert_eq!(first.battery_max, 4000);
        assert_eq!(first.temperature_min, -55);
        assert_eq!(first.battery_percentage, 80);
        assert_eq!(first.temperature, 25);
    }

    #[test]
    fn test_flatten_empty() {
        assert!(flatten("r", &[]).is_empty());
    }

    #[test]
    fn test_battery_percentage_clamps() {
        assert_eq!(battery_percentage(-10), 0);
        assert_eq!(battery_percentage(2000), 50);
        assert_eq!(battery_percentage(9000), 100);
    }

    #[test]
    fn test_record_wire_format() {
        let snapshot = DeviceSnapshot {
            device_id: "dev1".to_string(),
            timestamp: Utc.timestamp_millis_opt(1_000).unwrap(),
            events: vec![event(0, vec![10], vec![1])],
        };
        let json = serde_json::to_value(&flatten("r", &[snapshot])[0]).unwrap();
        assert_eq!(json["reportUniqueId"], "r");
        assert_eq!(json["batteryPercentageTarget"], 15);
        assert_eq!(json["temperatureTarget"], 55);
    }
}
