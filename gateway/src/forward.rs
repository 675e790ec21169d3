use crate::client::{PartitionClient, PartitionResponse};
use crate::directory::PartitionDirectory;
use crate::errors::{Error, Result};
use crate::metrics::{EVENTS_FORWARDED_TOTAL, PARTITION_FAILURES_TOTAL};
use crate::registry::{EntityKind, EntityRegistry};
use ingestor::store::IN_PROGRESS;
use reqwest::Url;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `/api/events/{device_id}` with the id percent-encoded as one segment.
pub fn events_path(device_id: &str) -> Result<String> {
    let mut url = Url::parse("http://partition/api/events").map_err(|e| Error::Config(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config("events URL cannot hold a path".to_string()))?
        .push(device_id);
    Ok(url.path().to_string())
}

/// Sends event batches to the partition owning their device.
pub struct EventForwarder {
    registry: Arc<EntityRegistry>,
    directory: Arc<dyn PartitionDirectory>,
    client: Arc<dyn PartitionClient>,
    cancel: CancellationToken,
}

impl EventForwarder {
    pub fn new(
        registry: Arc<EntityRegistry>,
        directory: Arc<dyn PartitionDirectory>,
        client: Arc<dyn PartitionClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            directory,
            client,
            cancel,
        }
    }

    /// Relays the owning partition's answer unchanged.
    pub async fn forward(&self, device_id: &str, body: Vec<u8>) -> Result<PartitionResponse> {
        if device_id.trim().is_empty() {
            return Err(Error::Validation("Device id cannot be empty".to_string()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = self.registry.partition_key_for(device_id);
        let partition = self.directory.resolve(IN_PROGRESS.name(), key).await?;
        debug!(device_id = %device_id, endpoint = %partition.endpoint, key, "Forwarding event batch");

        let path = events_path(device_id)?;
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = self.client.post(&partition, &path, body) => response,
        }
        .map_err(|e| {
            PARTITION_FAILURES_TOTAL.inc();
            warn!(device_id = %device_id, endpoint = %partition.endpoint, "Forwarding failed: {}", e);
            e
        })?;

        // Only devices a partition accepted are remembered
        if (200..300).contains(&response.status) {
            self.registry.register(device_id, EntityKind::Device);
        }

        EVENTS_FORWARDED_TOTAL.inc();
        Ok(response)
    }
}
