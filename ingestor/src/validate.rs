use crate::errors::{Error, Result};
use crate::model::DeviceEvent;

/// Validates an inbound batch for one device
pub fn validate_batch(device_id: &str, events: &[DeviceEvent]) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    for (position, event) in events.iter().enumerate() {
        validate_event(event).map_err(|e| match e {
            Error::Validation(msg) => Error::Validation(format!("event {}: {}", position, msg)),
            other => other,
        })?;
    }

    Ok(())
}

/// Validates a single event
pub fn validate_event(event: &DeviceEvent) -> Result<()> {
    // Frequency and magnitude are bin pairs
    if event.frequency.len() != event.magnitude.len() {
        return Err(Error::Validation(format!(
            "Frequency has {} bins but magnitude has {}",
            event.frequency.len(),
            event.magnitude.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::event_at;

    #[test]
    fn test_valid_batch() {
        let events = vec![event_at(1_000, 0), event_at(2_000, 1)];
        assert!(validate_batch("dev-1", &events).is_ok());
    }

    #[test]
    fn test_empty_batch_is_valid() {
        assert!(validate_batch("dev-1", &[]).is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        let events = vec![event_at(1_000, 0)];
        assert!(validate_batch("", &events).is_err());
        assert!(validate_batch("   ", &events).is_err());
    }

    #[test]
    fn test_raw_readings_are_not_range_checked() {
        let mut event = event_at(1_000, -1);
        event.battery_level = 4095;
        event.temp_external = -80;
        event.temp_internal = 250;
        event.data_points_count = -3;
        assert!(validate_batch("dev-1", &[event]).is_ok());
    }

    #[test]
    fn test_mismatched_bins() {
        let mut event = event_at(1_000, 0);
        event.magnitude.pop();
        let err = validate_batch("dev-1", &[event_at(500, 1), event]).unwrap_err();
        assert!(err.to_string().contains("event 1"));
    }
}
