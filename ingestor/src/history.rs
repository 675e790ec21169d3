use crate::errors::Result;
use crate::metrics::HISTORY_KEY_COLLISIONS_TOTAL;
use crate::model::DeviceEventSeries;
use crate::store::{Transaction, HISTORY};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Archives a completed series under a unique timestamp key.
///
/// Occupied slots are probed forward one millisecond at a time inside the
/// caller's transaction. Each probe locks the slot, so two writers cannot
/// claim the same advanced key. Returns the key the series was stored under.
pub async fn append(tx: &mut dyn Transaction, mut series: DeviceEventSeries) -> Result<DateTime<Utc>> {
    let mut key = series.timestamp;
    let mut probes = 0u32;

    while HISTORY.contains_key(tx, &key).await? {
        key += Duration::milliseconds(1);
        probes += 1;
    }

    if probes > 0 {
        HISTORY_KEY_COLLISIONS_TOTAL.inc_by(f64::from(probes));
        debug!(
            device_id = %series.device_id,
            original = %series.timestamp,
            committed = %key,
            probes,
            "History key collision resolved"
        );
        // Keep the record's timestamp equal to its key
        series.timestamp = key;
    }

    HISTORY.put(tx, &key, &series).await?;
    Ok(key)
}
