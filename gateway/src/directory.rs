use crate::errors::{Error, Result};
use async_trait::async_trait;
use ingestor::router::PartitionKey;

/// One partition: an inclusive slice of the signed 64-bit key space and the
/// node that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub low_key: PartitionKey,
    pub high_key: PartitionKey,
    pub endpoint: String,
}

impl PartitionInfo {
    pub fn owns(&self, key: PartitionKey) -> bool {
        self.low_key <= key && key <= self.high_key
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PartitionDirectory: Send + Sync {
    /// Partitions holding `collection`, ordered by low key.
    async fn list_partitions(&self, collection: &str) -> Result<Vec<PartitionInfo>>;

    /// The partition owning `key`.
    async fn resolve(&self, collection: &str, key: PartitionKey) -> Result<PartitionInfo>;
}

/// Fixed set of nodes splitting the key space into equal ranges.
pub struct StaticDirectory {
    partitions: Vec<PartitionInfo>,
}

impl StaticDirectory {
    pub fn new(endpoints: Vec<String>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::Config("at least one partition endpoint is required".to_string()));
        }

        let count = endpoints.len() as i128;
        let span = 1_i128 << 64;
        let min = i128::from(i64::MIN);

        let partitions = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| {
                let i = i as i128;
                let low = min + span * i / count;
                let high = min + span * (i + 1) / count - 1;
                PartitionInfo {
                    low_key: low as i64,
                    high_key: high as i64,
                    endpoint,
                }
            })
            .collect();

        Ok(Self { partitions })
    }

    pub fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }
}

#[async_trait]
impl PartitionDirectory for StaticDirectory {
    async fn list_partitions(&self, _collection: &str) -> Result<Vec<PartitionInfo>> {
        Ok(self.partitions.clone())
    }

    async fn resolve(&self, collection: &str, key: PartitionKey) -> Result<PartitionInfo> {
        self.partitions
            .iter()
            .find(|p| p.owns(key))
            .cloned()
            .ok_or_else(|| Error::NoPartitions(collection.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("http://node-{}:8081", i)).collect()
    }

    #[test]
    fn test_single_partition_covers_everything() {
        let directory = StaticDirectory::new(endpoints(1)).unwrap();
        let p = &directory.partitions()[0];
        assert_eq!(p.low_key, i64::MIN);
        assert_eq!(p.high_key, i64::MAX);
    }

    #[test]
    fn test_ranges_are_contiguous() {
        let directory = StaticDirectory::new(endpoints(3)).unwrap();
        let partitions = directory.partitions();

        assert_eq!(partitions[0].low_key, i64::MIN);
        assert_eq!(partitions[2].high_key, i64::MAX);
        for pair in partitions.windows(2) {
            assert_eq!(pair[0].high_key + 1, pair[1].low_key);
        }
    }

    #[test]
    fn test_no_endpoints_rejected() {
        assert!(matches!(StaticDirectory::new(Vec::new()), Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_finds_owner() {
        let directory = StaticDirectory::new(endpoints(4)).unwrap();

        tokio_test::block_on(async {
            for key in [i64::MIN, -1, 0, 1, i64::MAX] {
                let owner = directory.resolve("devices.in_progress", key).await.unwrap();
                assert!(owner.owns(key));
            }
            assert_eq!(
                directory.resolve("devices.in_progress", 0).await.unwrap().endpoint,
                "http://node-2:8081"
            );
        });
    }
}
