use crate::errors::Result;
use crate::model::EdgeDevice;
use crate::store::{Transaction, COUNTERS};

/// Adds to a device's counters inside the caller's transaction.
///
/// The record is read in update mode so the increment commits or rolls back
/// together with the series mutation it accounts for.
pub async fn increment(
    tx: &mut dyn Transaction,
    device_id: &str,
    events_delta: u64,
    messages_delta: u64,
) -> Result<EdgeDevice> {
    let key = device_id.to_string();
    let mut device = COUNTERS
        .get_for_update(tx, &key)
        .await?
        .unwrap_or_else(|| EdgeDevice::new(device_id));

    device.events_count += events_delta;
    device.messages_count += messages_delta;

    COUNTERS.put(tx, &key, &device).await?;
    Ok(device)
}

pub async fn get(tx: &mut dyn Transaction, device_id: &str) -> Result<Option<EdgeDevice>> {
    COUNTERS.get(tx, &device_id.to_string()).await
}
