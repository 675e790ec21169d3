//! Runs one logical query against every partition and merges the answers.
//!
//! Partitions are visited sequentially in directory order. The first failing
//! partition aborts the whole query: partial results are discarded and the
//! remaining partitions are never called.

use crate::client::PartitionClient;
use crate::directory::{PartitionDirectory, PartitionInfo};
use crate::errors::{Error, Result};
use crate::metrics::{FANOUT_LATENCY_SECONDS, FANOUT_REQUESTS_TOTAL, PARTITION_FAILURES_TOTAL};
use ingestor::model::{DeviceEventRow, DeviceEventRowList, DeviceEventSeries, DeviceSnapshot};
use ingestor::store::HISTORY;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DOWNLOAD_BATCH_SIZE: usize = 200;

/// How per-partition answers fold into one result.
pub trait MergeStrategy {
    type Item: DeserializeOwned;
    type Output;

    fn empty(&self) -> Self::Output;

    fn merge(&self, acc: &mut Self::Output, item: Self::Item);
}

/// Numeric total.
pub struct Sum;

impl MergeStrategy for Sum {
    type Item = u64;
    type Output = u64;

    fn empty(&self) -> u64 {
        0
    }

    fn merge(&self, acc: &mut u64, item: u64) {
        *acc = acc.saturating_add(item);
    }
}

/// Union of lists in partition order, duplicates kept.
pub struct Concatenate<T>(PhantomData<fn() -> T>);

impl<T> Concatenate<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Concatenate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> MergeStrategy for Concatenate<T> {
    type Item = Vec<T>;
    type Output = Vec<T>;

    fn empty(&self) -> Vec<T> {
        Vec::new()
    }

    fn merge(&self, acc: &mut Vec<T>, item: Vec<T>) {
        acc.extend(item);
    }
}

/// Pages already windowed by each partition, stitched together.
///
/// The result can hold up to `partitions * page_size` rows; `total_count` is
/// the sum over partitions.
pub struct WindowedPage {
    pub page_index: usize,
    pub page_size: usize,
}

impl MergeStrategy for WindowedPage {
    type Item = DeviceEventRowList;
    type Output = DeviceEventRowList;

    fn empty(&self) -> DeviceEventRowList {
        DeviceEventRowList::empty(self.page_index, self.page_size)
    }

    fn merge(&self, acc: &mut DeviceEventRowList, item: DeviceEventRowList) {
        acc.rows.extend(item.rows);
        acc.total_count += item.total_count;
        if acc.search_start_timestamp.is_none() {
            acc.search_start_timestamp = item.search_start_timestamp;
        }
    }
}

pub struct PartitionFanout {
    directory: Arc<dyn PartitionDirectory>,
    client: Arc<dyn PartitionClient>,
    cancel: CancellationToken,
}

impl PartitionFanout {
    pub fn new(
        directory: Arc<dyn PartitionDirectory>,
        client: Arc<dyn PartitionClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            directory,
            client,
            cancel,
        }
    }

    async fn partitions(&self, collection: &str) -> Result<Vec<PartitionInfo>> {
        let partitions = self.directory.list_partitions(collection).await?;
        if partitions.is_empty() {
            return Err(Error::NoPartitions(collection.to_string()));
        }
        Ok(partitions)
    }

    /// One partition call, observing cancellation.
    async fn fetch<T: DeserializeOwned>(&self, partition: &PartitionInfo, path_and_query: &str) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = self.client.get(partition, path_and_query) => result,
        };

        let body = result.map_err(|e| {
            PARTITION_FAILURES_TOTAL.inc();
            warn!(
                endpoint = %partition.endpoint,
                low_key = partition.low_key,
                "Partition query {} failed: {}",
                path_and_query,
                e
            );
            e
        })?;

        serde_json::from_str(&body).map_err(|e| {
            PARTITION_FAILURES_TOTAL.inc();
            warn!(endpoint = %partition.endpoint, "Unreadable partition answer: {}", e);
            Error::Json(e)
        })
    }

    /// Sends `path_and_query` to every partition of `collection` and folds
    /// the answers with `strategy`.
    pub async fn query<M: MergeStrategy>(&self, collection: &str, path_and_query: &str, strategy: &M) -> Result<M::Output> {
        FANOUT_REQUESTS_TOTAL.inc();
        let start = Instant::now();

        let partitions = self.partitions(collection).await?;
        let mut acc = strategy.empty();

        for partition in &partitions {
            let item: M::Item = self.fetch(partition, path_and_query).await?;
            strategy.merge(&mut acc, item);
        }

        FANOUT_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        debug!("Fan-out {} merged {} partitions", path_and_query, partitions.len());
        Ok(acc)
    }

    /// History rows keyed within `[start, end]` from every partition, paged
    /// from each partition in batches until it runs dry.
    pub async fn collect_key_range(&self, start: &str, end: &str) -> Result<Vec<DeviceEventRow>> {
        FANOUT_REQUESTS_TOTAL.inc();
        let timer = Instant::now();

        let partitions = self.partitions(HISTORY.name()).await?;
        let mut rows = Vec::new();

        for partition in &partitions {
            let mut index_start = 0;
            loop {
                let path = format!(
                    "/api/devices/history/byKeyRange/{}/{}/{}/{}",
                    start, end, index_start, DOWNLOAD_BATCH_SIZE
                );
                let batch: Vec<DeviceSnapshot> = self.fetch(partition, &path).await?;
                if batch.is_empty() {
                    break;
                }

                index_start += batch.len();
                for snapshot in batch {
                    let series = DeviceEventSeries::from(snapshot);
                    rows.extend(series.rows());
                }
            }
        }

        FANOUT_LATENCY_SECONDS.observe(timer.elapsed().as_secs_f64());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockPartitionClient;
    use crate::directory::MockPartitionDirectory;
    use chrono::{TimeZone, Utc};
    use ingestor::model::DeviceEvent;
    use mockall::Sequence;

    fn partitions(n: usize) -> Vec<PartitionInfo> {
        (0..n)
            .map(|i| PartitionInfo {
                low_key: i as i64 * 100,
                high_key: i as i64 * 100 + 99,
                endpoint: format!("http://p{}", i),
            })
            .collect()
    }

    fn directory_with(n: usize) -> Arc<MockPartitionDirectory> {
        let mut directory = MockPartitionDirectory::new();
        directory
            .expect_list_partitions()
            .returning(move |_| Ok(partitions(n)));
        Arc::new(directory)
    }

    fn fanout(directory: Arc<MockPartitionDirectory>, client: MockPartitionClient) -> PartitionFanout {
        PartitionFanout::new(directory, Arc::new(client), CancellationToken::new())
    }

    fn answers(client: &mut MockPartitionClient, bodies: &[(&'static str, &'static str)]) {
        let mut seq = Sequence::new();
        for (endpoint, body) in bodies {
            let endpoint = endpoint.to_string();
            let body = body.to_string();
            client
                .expect_get()
                .withf(move |p: &PartitionInfo, _path: &str| p.endpoint == endpoint)
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| Ok(body.clone()));
        }
    }

    fn snapshot(device_id: &str, millis: i64) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: device_id.to_string(),
            timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
            events: vec![DeviceEvent {
                timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
                measurement_type: "vibration".to_string(),
                sensor_index: 0,
                temp_external: 20,
                temp_internal: 30,
                battery_level: 3000,
                data_points_count: 1,
                frequency: vec![5],
                magnitude: vec![9],
            }],
        }
    }

    #[tokio::test]
    async fn test_sum_across_partitions() {
        let mut client = MockPartitionClient::new();
        answers(
            &mut client,
            &[("http://p0", "10"), ("http://p1", "20"), ("http://p2", "5"), ("http://p3", "0")],
        );

        let total = fanout(directory_with(4), client)
            .query("devices.counters", "/api/devices/queue/length", &Sum)
            .await
            .unwrap();
        assert_eq!(total, 35);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_partitions() {
        let mut client = MockPartitionClient::new();
        client
            .expect_get()
            .withf(|p: &PartitionInfo, _: &str| p.endpoint == "http://p0")
            .times(1)
            .returning(|_, _| Ok("10".to_string()));
        client
            .expect_get()
            .withf(|p: &PartitionInfo, _: &str| p.endpoint == "http://p1")
            .times(1)
            .returning(|p, _| {
                Err(Error::PartitionUnavailable {
                    endpoint: p.endpoint.clone(),
                    status: 503,
                })
            });
        client
            .expect_get()
            .withf(|p: &PartitionInfo, _: &str| p.endpoint == "http://p2")
            .times(0);

        let result = fanout(directory_with(3), client)
            .query("devices.counters", "/api/devices/queue/length", &Sum)
            .await;

        match result {
            Err(Error::PartitionUnavailable { endpoint, status }) => {
                assert_eq!(endpoint, "http://p1");
                assert_eq!(status, 503);
            }
            other => panic!("expected partition failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concatenate_keeps_partition_order_and_duplicates() {
        let first = serde_json::to_string(&vec![snapshot("a", 1), snapshot("b", 2)]).unwrap();
        let second = serde_json::to_string(&vec![snapshot("a", 1)]).unwrap();

        let mut client = MockPartitionClient::new();
        let mut seq = Sequence::new();
        for body in [first, second] {
            client
                .expect_get()
                .withf(|_: &PartitionInfo, path: &str| path == "/api/devices")
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| Ok(body.clone()));
        }

        let merged = fanout(directory_with(2), client)
            .query("devices.in_progress", "/api/devices", &Concatenate::<DeviceSnapshot>::new())
            .await
            .unwrap();
        let ids: Vec<_> = merged.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_windowed_page_merge() {
        let ts = Utc.timestamp_millis_opt(5_000).unwrap();
        let row = |device: &str| DeviceEventRow {
            timestamp: ts,
            device_id: device.to_string(),
            measurement_type: "vibration".to_string(),
            sensor_index: 0,
            temperature: 20,
            battery_level: 3000,
            data_points_count: 1,
        };
        let page_a = DeviceEventRowList {
            page_index: 1,
            page_size: 2,
            total_count: 0,
            search_start_timestamp: None,
            rows: Vec::new(),
        };
        let page_b = DeviceEventRowList {
            page_index: 1,
            page_size: 2,
            total_count: 4,
            search_start_timestamp: Some(ts),
            rows: vec![row("x"), row("y")],
        };

        let mut client = MockPartitionClient::new();
        let bodies = [
            serde_json::to_string(&page_a).unwrap(),
            serde_json::to_string(&page_b).unwrap(),
        ];
        let mut seq = Sequence::new();
        for body in bodies {
            client
                .expect_get()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| Ok(body.clone()));
        }

        let page = fanout(directory_with(2), client)
            .query(
                "devices.history",
                "/api/devices/history/page/1/pageSize/2",
                &WindowedPage {
                    page_index: 1,
                    page_size: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.page_index, 1);
        assert_eq!(page.total_count, 4);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.search_start_timestamp, Some(ts));
    }

    #[tokio::test]
    async fn test_no_partitions() {
        let mut directory = MockPartitionDirectory::new();
        directory.expect_list_partitions().returning(|_| Ok(Vec::new()));
        let client = MockPartitionClient::new();

        let result = fanout(Arc::new(directory), client)
            .query("devices.counters", "/api/devices/queue/length", &Sum)
            .await;
        assert!(matches!(result, Err(Error::NoPartitions(_))));
    }

    #[tokio::test]
    async fn test_cancelled_fanout_issues_no_calls() {
        let mut client = MockPartitionClient::new();
        client.expect_get().times(0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let fanout = PartitionFanout::new(directory_with(2), Arc::new(client), cancel);

        let result = fanout
            .query("devices.counters", "/api/devices/queue/length", &Sum)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_malformed_partition_answer() {
        let mut client = MockPartitionClient::new();
        answers(&mut client, &[("http://p0", "not a number")]);

        let result = fanout(directory_with(1), client)
            .query("devices.counters", "/api/devices/queue/length", &Sum)
            .await;
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_collect_key_range_pages_until_empty() {
        let full: Vec<DeviceSnapshot> = (0..DOWNLOAD_BATCH_SIZE as i64).map(|i| snapshot("a", i)).collect();
        let tail = vec![snapshot("b", 9_000)];

        let mut client = MockPartitionClient::new();
        let mut seq = Sequence::new();
        let pages = [
            ("/0/200", serde_json::to_string(&full).unwrap()),
            ("/200/200", serde_json::to_string(&tail).unwrap()),
            ("/201/200", "[]".to_string()),
        ];
        for (suffix, body) in pages {
            client
                .expect_get()
                .withf(move |_: &PartitionInfo, path: &str| path.ends_with(suffix))
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| Ok(body.clone()));
        }

        let rows = fanout(directory_with(1), client)
            .collect_key_range("1970-01-01T00:00:00.000Z", "1970-01-01T00:00:10.000Z")
            .await
            .unwrap();
        assert_eq!(rows.len(), DOWNLOAD_BATCH_SIZE + 1);
        assert_eq!(rows.last().unwrap().device_id, "b");
    }
}
