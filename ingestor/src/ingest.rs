use crate::assembler::{self, MergeOutcome};
use crate::counters;
use crate::errors::Result;
use crate::history;
use crate::metrics::{
    BATCHES_TOTAL, EVENTS_TOTAL, INGEST_LATENCY_SECONDS, INVALID_BATCHES_TOTAL, MESSAGES_COMPLETED_TOTAL,
};
use crate::model::{DeviceEvent, DeviceEventSeries};
use crate::retry::RetryPolicy;
use crate::store::{Transaction, TransactionalStore, IN_PROGRESS};
use crate::validate::validate_batch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Lifecycle of one ingestion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Receiving,
    Merging,
    Completing,
    Persisting,
    Committing,
    RetryWait,
    Committed,
    Failed,
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestionState::Receiving => "receiving",
            IngestionState::Merging => "merging",
            IngestionState::Completing => "completing",
            IngestionState::Persisting => "persisting",
            IngestionState::Committing => "committing",
            IngestionState::RetryWait => "retry_wait",
            IngestionState::Committed => "committed",
            IngestionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transition(device_id: &str, state: IngestionState) {
    trace!(device_id = %device_id, state = %state, "Ingestion state");
}

/// Per-device FIFO queue slots.
///
/// Requests for the same device run strictly one at a time in arrival order
/// (tokio's mutex is fair); different devices never wait on each other. Idle
/// slots are removed when their last holder leaves.
#[derive(Default)]
pub struct DeviceLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

pub struct DeviceSlot<'a> {
    locks: &'a DeviceLocks,
    device_id: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceLocks {
    pub async fn lock(&self, device_id: &str) -> DeviceSlot<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(device_id.to_string()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;

        DeviceSlot {
            locks: self,
            device_id: device_id.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for DeviceSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.locks.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this slot still reference it: nobody is queued
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.device_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub device_id: String,
    pub events_accepted: usize,
    /// History key of the message this batch completed, if any.
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

/// Runs the assembly state machine for inbound batches of one partition.
pub struct IngestionService {
    store: Arc<dyn TransactionalStore>,
    retry: RetryPolicy,
    locks: DeviceLocks,
    cancel: CancellationToken,
}

impl IngestionService {
    pub fn new(store: Arc<dyn TransactionalStore>, retry: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            store,
            retry,
            locks: DeviceLocks::default(),
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    /// Merges a batch into the device's in-progress series, archiving the
    /// previous series when the batch completes it. Series, history and
    /// counters change in one transaction, retried on store timeouts.
    pub async fn ingest(&self, device_id: &str, events: Vec<DeviceEvent>) -> Result<IngestOutcome> {
        BATCHES_TOTAL.inc();
        transition(device_id, IngestionState::Receiving);

        if let Err(e) = validate_batch(device_id, &events) {
            INVALID_BATCHES_TOTAL.inc();
            return Err(e);
        }

        if events.is_empty() {
            debug!(device_id = %device_id, "Empty batch, nothing to ingest");
            return Ok(IngestOutcome {
                device_id: device_id.to_string(),
                events_accepted: 0,
                completed_at: None,
                attempts: 0,
            });
        }

        let incoming = DeviceEventSeries::new(device_id, events)?;
        let start = Instant::now();

        let _slot = self.locks.lock(device_id).await;

        let incoming = &incoming;
        let result = self
            .retry
            .run(&self.cancel, move |attempt| self.attempt(incoming, attempt))
            .await;

        match result {
            Ok(outcome) => {
                transition(device_id, IngestionState::Committed);
                INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                EVENTS_TOTAL.inc_by(outcome.events_accepted as f64);
                if let Some(key) = outcome.completed_at {
                    MESSAGES_COMPLETED_TOTAL.inc();
                    info!(device_id = %device_id, completed_at = %key, "Message completed");
                }
                Ok(outcome)
            }
            Err(e) => {
                transition(device_id, IngestionState::Failed);
                warn!(device_id = %device_id, "Ingestion failed: {}", e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, incoming: &DeviceEventSeries, attempt: u32) -> Result<IngestOutcome> {
        if attempt > 1 {
            transition(&incoming.device_id, IngestionState::RetryWait);
        }

        let mut tx = self.store.begin_transaction().await?;

        match apply(tx.as_mut(), incoming.clone()).await {
            Ok(mut outcome) => {
                transition(&incoming.device_id, IngestionState::Committing);
                tx.commit().await?;
                outcome.attempts = attempt;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(abort_err) = tx.abort().await {
                    warn!(device_id = %incoming.device_id, "Transaction abort failed: {}", abort_err);
                }
                Err(e)
            }
        }
    }
}

/// One attempt's worth of work inside an open transaction.
async fn apply(tx: &mut dyn Transaction, incoming: DeviceEventSeries) -> Result<IngestOutcome> {
    let device_id = incoming.device_id.clone();
    let events_accepted = incoming.events.len();

    transition(&device_id, IngestionState::Merging);
    let current = IN_PROGRESS.get_for_update(tx, &device_id).await?;
    let MergeOutcome {
        next_in_progress,
        completed,
    } = assembler::merge(current, incoming);
    IN_PROGRESS.put(tx, &device_id, &next_in_progress).await?;

    let completed_at = match completed {
        Some(series) => {
            transition(&device_id, IngestionState::Completing);
            transition(&device_id, IngestionState::Persisting);
            Some(history::append(tx, series).await?)
        }
        None => None,
    };

    counters::increment(
        tx,
        &device_id,
        events_accepted as u64,
        u64::from(completed_at.is_some()),
    )
    .await?;

    Ok(IngestOutcome {
        device_id,
        events_accepted,
        completed_at,
        attempts: 0,
    })
}
