use super::{KeyRange, LockMode, Transaction, TransactionalStore};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(4);

type LockKey = (String, String);

/// In-process store with exclusive per-key locks and buffered writes.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

struct Shared {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    /// Lock table: key -> owning transaction id.
    locks: Mutex<HashMap<LockKey, u64>>,
    released: Notify,
    next_tx: AtomicU64,
    lock_timeout: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                collections: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                released: Notify::new(),
                next_tx: AtomicU64::new(1),
                lock_timeout,
            }),
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = guard(&self.shared.collections).keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl Shared {
    fn try_acquire(&self, key: &LockKey, owner: u64) -> bool {
        let mut locks = guard(&self.locks);
        match locks.get(key) {
            Some(holder) => *holder == owner,
            None => {
                locks.insert(key.clone(), owner);
                true
            }
        }
    }

    async fn acquire(&self, key: &LockKey, owner: u64) -> Result<()> {
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            // Register for wakeups before checking so a release in between is not lost
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire(key, owner) {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                debug!(collection = %key.0, key = %key.1, tx = owner, "Lock wait timed out");
                return Err(Error::TransientTimeout(format!(
                    "lock on {}/{} not acquired within {:?}",
                    key.0, key.1, self.lock_timeout
                )));
            }
        }
    }

    fn release_all(&self, owner: u64, held: &mut HashSet<LockKey>) {
        if held.is_empty() {
            return;
        }
        {
            let mut locks = guard(&self.locks);
            for key in held.drain() {
                if locks.get(&key) == Some(&owner) {
                    locks.remove(&key);
                }
            }
        }
        self.released.notify_waiters();
    }

    fn committed(&self, collection: &str, key: &str) -> Option<Value> {
        guard(&self.collections)
            .get(collection)
            .and_then(|entries| entries.get(key))
            .cloned()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    async fn get_or_create_collection(&self, name: &str) -> Result<()> {
        guard(&self.shared.collections)
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>> {
        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            id,
            shared: Arc::clone(&self.shared),
            held: HashSet::new(),
            writes: BTreeMap::new(),
        }))
    }
}

struct MemoryTransaction {
    id: u64,
    shared: Arc<Shared>,
    held: HashSet<LockKey>,
    writes: BTreeMap<LockKey, Value>,
}

impl MemoryTransaction {
    async fn lock(&mut self, collection: &str, key: &str) -> Result<LockKey> {
        let lock_key = (collection.to_string(), key.to_string());
        if !self.held.contains(&lock_key) {
            self.shared.acquire(&lock_key, self.id).await?;
            self.held.insert(lock_key.clone());
        }
        Ok(lock_key)
    }

    fn read(&self, lock_key: &LockKey) -> Option<Value> {
        self.writes
            .get(lock_key)
            .cloned()
            .or_else(|| self.shared.committed(&lock_key.0, &lock_key.1))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, collection: &str, key: &str, mode: LockMode) -> Result<Option<Value>> {
        let lock_key = match mode {
            LockMode::Update => self.lock(collection, key).await?,
            LockMode::Shared => (collection.to_string(), key.to_string()),
        };
        Ok(self.read(&lock_key))
    }

    async fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<()> {
        let lock_key = self.lock(collection, key).await?;
        self.writes.insert(lock_key, value);
        Ok(())
    }

    async fn contains_key(&mut self, collection: &str, key: &str) -> Result<bool> {
        let lock_key = self.lock(collection, key).await?;
        Ok(self.read(&lock_key).is_some())
    }

    async fn scan(&mut self, collection: &str, range: &KeyRange) -> Result<Vec<(String, Value)>> {
        let mut merged: BTreeMap<String, Value> = guard(&self.shared.collections)
            .get(collection)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(k, _)| range.contains(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for ((write_collection, key), value) in &self.writes {
            if write_collection == collection && range.contains(key) {
                merged.insert(key.clone(), value.clone());
            }
        }

        Ok(merged
            .into_iter()
            .skip(range.offset)
            .take(range.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        let writes = std::mem::take(&mut this.writes);
        {
            let mut collections = guard(&this.shared.collections);
            for ((collection, key), value) in writes {
                collections.entry(collection).or_default().insert(key, value);
            }
        }
        let shared = Arc::clone(&this.shared);
        shared.release_all(this.id, &mut this.held);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.writes.clear();
        let shared = Arc::clone(&this.shared);
        shared.release_all(this.id, &mut this.held);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.shared.release_all(self.id, &mut self.held);
    }
}
