//! Per-device message assembly.
//!
//! Sensors report one slot at a time. When a batch arrives whose first event
//! reuses a sensor slot already present in the in-progress series, the
//! previous round is complete: it is handed back for archiving and the batch
//! starts a new series. Only the first event of the batch is inspected;
//! the rest are carried along unconditionally.

use crate::model::DeviceEventSeries;

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub next_in_progress: DeviceEventSeries,
    pub completed: Option<DeviceEventSeries>,
}

pub fn merge(current: Option<DeviceEventSeries>, incoming: DeviceEventSeries) -> MergeOutcome {
    let Some(first) = incoming.events.first() else {
        // Nothing to merge; keep whatever is in progress
        return MergeOutcome {
            next_in_progress: current.unwrap_or(incoming),
            completed: None,
        };
    };

    match current {
        None => MergeOutcome {
            next_in_progress: incoming,
            completed: None,
        },
        Some(current) if current.contains_sensor(first.sensor_index) => MergeOutcome {
            next_in_progress: incoming,
            completed: Some(current),
        },
        Some(mut current) => {
            current.events.extend(incoming.events);
            MergeOutcome {
                next_in_progress: current,
                completed: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{event_at, series};

    #[test]
    fn test_first_batch_starts_series() {
        let incoming = series("dev1", vec![event_at(1_000, 0)]);
        let outcome = merge(None, incoming.clone());
        assert_eq!(outcome.next_in_progress, incoming);
        assert!(outcome.completed.is_none());
    }

    #[test]
    fn test_new_sensor_appends() {
        let current = series("dev1", vec![event_at(1_000, 0)]);
        let incoming = series("dev1", vec![event_at(2_000, 1), event_at(2_100, 2)]);

        let outcome = merge(Some(current), incoming);
        assert!(outcome.completed.is_none());

        let indexes: Vec<i32> = outcome.next_in_progress.events.iter().map(|e| e.sensor_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(outcome.next_in_progress.timestamp, event_at(1_000, 0).timestamp);
    }

    #[test]
    fn test_repeated_sensor_completes() {
        let current = series("dev1", vec![event_at(1_000, 0), event_at(2_000, 1)]);
        let incoming = series("dev1", vec![event_at(3_000, 0)]);

        let outcome = merge(Some(current.clone()), incoming.clone());
        assert_eq!(outcome.completed, Some(current));
        assert_eq!(outcome.next_in_progress, incoming);
    }

    #[test]
    fn test_repeat_matches_any_position() {
        let current = series("dev1", vec![event_at(1_000, 3), event_at(2_000, 5)]);
        let incoming = series("dev1", vec![event_at(3_000, 5)]);

        let outcome = merge(Some(current), incoming);
        assert!(outcome.completed.is_some());
    }

    #[test]
    fn test_only_first_event_is_inspected() {
        // Sensor 0 repeats in the second position; not a completion
        let current = series("dev1", vec![event_at(1_000, 0)]);
        let incoming = series("dev1", vec![event_at(2_000, 1), event_at(2_500, 0)]);

        let outcome = merge(Some(current), incoming);
        assert!(outcome.completed.is_none());
        assert_eq!(outcome.next_in_progress.events.len(), 3);
    }

    #[test]
    fn test_empty_incoming_is_noop() {
        let current = series("dev1", vec![event_at(1_000, 0)]);
        let empty = DeviceEventSeries {
            device_id: "dev1".to_string(),
            timestamp: event_at(5_000, 0).timestamp,
            events: Vec::new(),
        };

        let outcome = merge(Some(current.clone()), empty);
        assert_eq!(outcome.next_in_progress, current);
        assert!(outcome.completed.is_none());
    }

    #[test]
    fn test_exactly_one_completion_per_wrap() {
        let batches = [0, 1, 2, 0, 1, 0];
        let mut current = None;
        let mut completions = Vec::new();

        for (i, sensor) in batches.iter().enumerate() {
            let incoming = series("dev1", vec![event_at(1_000 * i as i64, *sensor)]);
            let outcome = merge(current.take(), incoming);
            if let Some(done) = outcome.completed {
                completions.push(done.events.len());
            }
            current = Some(outcome.next_in_progress);
        }

        assert_eq!(completions, vec![3, 2]);
        assert_eq!(current.unwrap().events.len(), 1);
    }
}
