//! Read paths served by one partition node.
//!
//! Every query runs in its own transaction and only reads committed state in
//! shared mode, so queries never block ingestion.

use crate::errors::{Error, Result};
use crate::model::{DeviceEventRowList, DeviceSnapshot};
use crate::store::{TransactionalStore, COUNTERS, HISTORY, IN_PROGRESS};
use chrono::{DateTime, Duration, TimeZone, Utc};

pub const MAX_PAGE_SIZE: usize = 1000;

/// History records read per store round trip while paging.
const HISTORY_SCAN_CHUNK: usize = 256;

/// Paged history request for this partition.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub page_index: usize,
    pub page_size: usize,
    pub device_id: Option<String>,
    pub starting_at: Option<DateTime<Utc>>,
}

impl PageQuery {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::Validation(format!(
                "pageSize must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, self.page_size
            )));
        }
        Ok(())
    }

    fn offset(&self) -> usize {
        self.page_index.saturating_mul(self.page_size)
    }
}

/// Every in-progress series, ordered by device id.
pub async fn device_snapshots(store: &dyn TransactionalStore) -> Result<Vec<DeviceSnapshot>> {
    let mut tx = store.begin_transaction().await?;
    let entries = IN_PROGRESS.scan(tx.as_mut(), None, None).await?;
    tx.commit().await?;

    Ok(entries.into_iter().map(|(_, series)| series.into()).collect())
}

/// Total events recorded by the counters of this partition, optionally
/// including events still waiting in in-progress series.
pub async fn queue_length(store: &dyn TransactionalStore, include_in_progress: bool) -> Result<u64> {
    let mut tx = store.begin_transaction().await?;

    let mut total: u64 = COUNTERS
        .scan(tx.as_mut(), None, None)
        .await?
        .iter()
        .map(|(_, device)| device.events_count)
        .sum();

    if include_in_progress {
        total += IN_PROGRESS
            .scan(tx.as_mut(), None, None)
            .await?
            .iter()
            .map(|(_, series)| series.events.len() as u64)
            .sum::<u64>();
    }

    tx.commit().await?;
    Ok(total)
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Validation(format!("timestamp out of range: {}", millis)))
}

/// History records stamped within `(now - start_ms_ago, now - end_ms_ago]`.
pub async fn history_interval(
    store: &dyn TransactionalStore,
    start_ms_ago: i64,
    end_ms_ago: i64,
    now: DateTime<Utc>,
) -> Result<Vec<DeviceSnapshot>> {
    if start_ms_ago < 0 || end_ms_ago < 0 {
        return Err(Error::Validation("Interval bounds cannot be negative".to_string()));
    }
    if start_ms_ago < end_ms_ago {
        return Err(Error::Validation(format!(
            "Interval start ({}) must be at or before its end ({})",
            start_ms_ago, end_ms_ago
        )));
    }

    let now_ms = now.timestamp_millis();
    // Keys are whole milliseconds: shift both bounds by one to turn the
    // half-open interval into a [start, end) key range
    let lower = millis_to_time(now_ms.saturating_sub(start_ms_ago).saturating_add(1))?;
    let upper = millis_to_time(now_ms.saturating_sub(end_ms_ago).saturating_add(1))?;

    let mut tx = store.begin_transaction().await?;
    let records = HISTORY.scan(tx.as_mut(), Some(&lower), Some(&upper)).await?;
    tx.commit().await?;

    Ok(records.into_iter().map(|(_, series)| series.into()).collect())
}

/// Flattened history rows of this partition, windowed to one page.
///
/// Rows come out in history key order. `deviceId` filters case-insensitively;
/// `startingAt` skips records keyed before it.
pub async fn history_page(store: &dyn TransactionalStore, query: &PageQuery) -> Result<DeviceEventRowList> {
    query.validate()?;

    let mut search_start_timestamp = query.starting_at;
    let mut total_count = 0;
    let mut rows = Vec::new();

    // Walk history in key-ordered chunks; only the page's rows are kept
    let mut tx = store.begin_transaction().await?;
    let mut cursor = query.starting_at;
    loop {
        let chunk = HISTORY
            .scan_window(tx.as_mut(), cursor.as_ref(), None, 0, Some(HISTORY_SCAN_CHUNK))
            .await?;
        let Some(last_key) = chunk.last().map(|(key, _)| *key) else {
            break;
        };
        let exhausted = chunk.len() < HISTORY_SCAN_CHUNK;
        cursor = Some(last_key + Duration::milliseconds(1));

        let matching = chunk.iter().filter(|(_, series)| {
            query
                .device_id
                .as_deref()
                .map_or(true, |wanted| series.device_id.eq_ignore_ascii_case(wanted))
        });

        for (key, series) in matching {
            search_start_timestamp.get_or_insert(*key);
            for row in series.rows() {
                if total_count >= query.offset() && rows.len() < query.page_size {
                    rows.push(row);
                }
                total_count += 1;
            }
        }

        if exhausted {
            break;
        }
    }
    tx.commit().await?;

    Ok(DeviceEventRowList {
        page_index: query.page_index,
        page_size: query.page_size,
        total_count,
        search_start_timestamp,
        rows,
    })
}

/// History records keyed within `[start, end]`, skipping `index_start` and
/// returning at most `batch_size`.
pub async fn history_key_range(
    store: &dyn TransactionalStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    index_start: usize,
    batch_size: usize,
) -> Result<Vec<DeviceSnapshot>> {
    if end < start {
        return Err(Error::Validation(format!(
            "Key range start {} is after its end {}",
            start, end
        )));
    }
    if batch_size == 0 || batch_size > MAX_PAGE_SIZE {
        return Err(Error::Validation(format!(
            "batchSize must be between 1 and {}, got {}",
            MAX_PAGE_SIZE, batch_size
        )));
    }

    let end_exclusive = end + Duration::milliseconds(1);

    let mut tx = store.begin_transaction().await?;
    let records = HISTORY
        .scan_window(tx.as_mut(), Some(&start), Some(&end_exclusive), index_start, Some(batch_size))
        .await?;
    tx.commit().await?;

    Ok(records.into_iter().map(|(_, series)| series.into()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters;
    use crate::history;
    use crate::model::fixtures::{event_at, series};
    use crate::store::MemoryStore;

    async fn seed_history(store: &MemoryStore, entries: &[(&str, i64, usize)]) {
        let mut tx = store.begin_transaction().await.unwrap();
        for (device, millis, events) in entries {
            let events = (0..*events).map(|i| event_at(millis + i as i64, i as i32)).collect();
            history::append(tx.as_mut(), series(device, events)).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[tokio::test]
    async fn test_queue_length_sums_counters() {
        let store = MemoryStore::default();
        let mut tx = store.begin_transaction().await.unwrap();
        counters::increment(tx.as_mut(), "a", 10, 1).await.unwrap();
        counters::increment(tx.as_mut(), "b", 5, 0).await.unwrap();
        IN_PROGRESS
            .put(tx.as_mut(), &"b".to_string(), &series("b", vec![event_at(1, 0), event_at(2, 1)]))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(queue_length(&store, false).await.unwrap(), 15);
        assert_eq!(queue_length(&store, true).await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_device_snapshots_lists_in_progress() {
        let store = MemoryStore::default();
        let mut tx = store.begin_transaction().await.unwrap();
        for device in ["b", "a"] {
            IN_PROGRESS
                .put(tx.as_mut(), &device.to_string(), &series(device, vec![event_at(1, 0)]))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let snapshots = device_snapshots(&store).await.unwrap();
        let ids: Vec<_> = snapshots.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_history_interval_bounds() {
        let store = MemoryStore::default();
        seed_history(&store, &[("a", 9_000, 1), ("b", 9_500, 1), ("c", 10_000, 1)]).await;

        // (10_000 - 1_000, 10_000 - 0] excludes the record at exactly 9_000
        let found = history_interval(&store, 1_000, 0, at(10_000)).await.unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let found = history_interval(&store, 1_000, 500, at(10_000)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, "b");
    }

    #[tokio::test]
    async fn test_history_interval_rejects_reversed_bounds() {
        let store = MemoryStore::default();
        assert!(matches!(
            history_interval(&store, 100, 500, at(10_000)).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_history_page_windows_rows() {
        let store = MemoryStore::default();
        seed_history(&store, &[("a", 1_000, 3), ("b", 2_000, 2), ("A", 3_000, 2)]).await;

        let page = history_page(
            &store,
            &PageQuery {
                page_index: 1,
                page_size: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total_count, 7);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].device_id, "a");
        assert_eq!(page.rows[1].device_id, "b");
        assert_eq!(page.search_start_timestamp, Some(at(1_000)));

        let filtered = history_page(
            &store,
            &PageQuery {
                page_index: 0,
                page_size: 10,
                device_id: Some("a".to_string()),
                starting_at: Some(at(1_500)),
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered.total_count, 2);
        assert!(filtered.rows.iter().all(|r| r.device_id == "A"));
        assert_eq!(filtered.search_start_timestamp, Some(at(1_500)));
    }

    #[tokio::test]
    async fn test_history_page_spans_scan_chunks() {
        let store = MemoryStore::default();
        let entries: Vec<(&str, i64, usize)> = (0..600_i64)
            .map(|i| (if i % 2 == 0 { "a" } else { "b" }, i * 10, 1))
            .collect();
        seed_history(&store, &entries).await;

        let page = history_page(
            &store,
            &PageQuery {
                page_index: 5,
                page_size: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total_count, 600);
        assert_eq!(page.rows.len(), 100);
        assert_eq!(page.rows[0].timestamp, at(5_000));
        assert_eq!(page.rows[99].timestamp, at(5_990));

        let filtered = history_page(
            &store,
            &PageQuery {
                page_index: 2,
                page_size: 100,
                device_id: Some("A".to_string()),
                starting_at: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered.total_count, 300);
        assert_eq!(filtered.rows.len(), 100);
        assert_eq!(filtered.rows[0].timestamp, at(4_000));
        assert_eq!(filtered.search_start_timestamp, Some(at(0)));
    }

    #[tokio::test]
    async fn test_history_page_past_end_is_empty() {
        let store = MemoryStore::default();
        seed_history(&store, &[("a", 1_000, 3)]).await;

        let page = history_page(
            &store,
            &PageQuery {
                page_index: 5,
                page_size: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.total_count, 3);
        assert!(page.rows.is_empty());
    }

    #[tokio::test]
    async fn test_history_page_size_limits() {
        let store = MemoryStore::default();
        for page_size in [0, MAX_PAGE_SIZE + 1] {
            let query = PageQuery {
                page_size,
                ..Default::default()
            };
            assert!(matches!(history_page(&store, &query).await, Err(Error::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_history_key_range_inclusive_with_skip() {
        let store = MemoryStore::default();
        seed_history(&store, &[("a", 1_000, 1), ("b", 2_000, 1), ("c", 3_000, 1), ("d", 4_000, 1)]).await;

        let found = history_key_range(&store, at(1_000), at(3_000), 1, 5).await.unwrap();
        let ids: Vec<_> = found.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let found = history_key_range(&store, at(1_000), at(4_000), 0, 2).await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
