use crate::errors::Result;
use crate::fanout::{Concatenate, PartitionFanout};
use crate::metrics::{REPORTS_PUBLISHED_TOTAL, REPORT_FAILURES_TOTAL};
use crate::publisher::{flatten, ReportPublisher};
use ingestor::model::DeviceSnapshot;
use ingestor::store::HISTORY;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically pushes recently completed messages to the report publisher.
pub struct Extender {
    fanout: Arc<PartitionFanout>,
    publisher: Arc<dyn ReportPublisher>,
    interval: Duration,
}

impl Extender {
    pub fn new(fanout: Arc<PartitionFanout>, publisher: Arc<dyn ReportPublisher>, interval: Duration) -> Self {
        Self {
            fanout,
            publisher,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Starting report extender with interval={}ms", self.interval.as_millis());

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(0) => debug!("No completed messages to report"),
                        Ok(count) => info!("Published {} report records", count),
                        Err(e) => {
                            REPORT_FAILURES_TOTAL.inc();
                            error!("Report run failed: {}", e);
                        }
                    }
                }
            }
        }

        info!("Report extender stopped");
    }

    /// Collects the history completed within the last interval, publishes it
    /// under a fresh report id and returns the number of records sent.
    pub async fn run_once(&self) -> Result<usize> {
        let report_id = uuid::Uuid::new_v4().to_string();
        let path = format!("/api/devices/history/interval/{}/0", self.interval.as_millis());

        let snapshots = self
            .fanout
            .query(HISTORY.name(), &path, &Concatenate::<DeviceSnapshot>::new())
            .await?;

        let records = flatten(&report_id, &snapshots);
        if records.is_empty() {
            return Ok(0);
        }

        self.publisher.publish(&records).await?;
        REPORTS_PUBLISHED_TOTAL.inc();
        debug!(report_id = %report_id, messages = snapshots.len(), "Report published");
        Ok(records.len())
    }
}
