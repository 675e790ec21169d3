//! Transactional, ordered key-value store contract.
//!
//! Collections are named and ordered by their encoded key. Every read and
//! write goes through a [`Transaction`]; writes become visible to other
//! transactions only on [`Transaction::commit`]. Reads in [`LockMode::Update`],
//! writes and existence probes take an exclusive per-key lock held until the
//! transaction finishes. A lock that cannot be acquired in time surfaces as
//! [`Error::TransientTimeout`].
//!
//! [`Collection`] pins a key and value schema onto a collection name so
//! callers never handle raw JSON.

pub mod memory;
pub mod postgres;

use crate::errors::{Error, Result};
use crate::model::{DeviceEventSeries, EdgeDevice};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Read committed state without locking.
    Shared,
    /// Lock the key for the rest of the transaction before reading.
    Update,
}

/// Half-open range `[start, end)` over encoded keys; `None` is unbounded.
/// `offset` and `limit` window the matching entries in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.start.as_deref().map_or(true, |s| key >= s) && self.end.as_deref().map_or(true, |e| key < e)
    }
}

#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn get_or_create_collection(&self, name: &str) -> Result<()>;

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// A unit of atomic work. Dropping a transaction without committing aborts it.
#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, collection: &str, key: &str, mode: LockMode) -> Result<Option<Value>>;

    async fn put(&mut self, collection: &str, key: &str, value: Value) -> Result<()>;

    /// Locks the key, then reports whether a value exists for it.
    async fn contains_key(&mut self, collection: &str, key: &str) -> Result<bool>;

    /// Entries in key order, including this transaction's own writes,
    /// windowed by the range's offset and limit.
    async fn scan(&mut self, collection: &str, range: &KeyRange) -> Result<Vec<(String, Value)>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Key types that can be encoded into an order-preserving string.
pub trait StoreKey: Sized + Send + Sync {
    fn encode(&self) -> String;

    fn decode(raw: &str) -> Result<Self>;
}

impl StoreKey for String {
    fn encode(&self) -> String {
        self.clone()
    }

    fn decode(raw: &str) -> Result<Self> {
        Ok(raw.to_string())
    }
}

const SIGN_BIT: u64 = 1 << 63;

/// Millisecond precision. Flipping the sign bit and zero-padding keeps
/// lexicographic order equal to chronological order, pre-epoch included.
impl StoreKey for DateTime<Utc> {
    fn encode(&self) -> String {
        format!("{:020}", (self.timestamp_millis() as u64) ^ SIGN_BIT)
    }

    fn decode(raw: &str) -> Result<Self> {
        let biased: u64 = raw
            .parse()
            .map_err(|_| Error::InvalidKey(format!("not a timestamp key: {}", raw)))?;
        let millis = (biased ^ SIGN_BIT) as i64;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::InvalidKey(format!("timestamp out of range: {}", millis)))
    }
}

/// Typed handle on a named collection
pub struct Collection<K, V> {
    name: &'static str,
    _schema: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Collection<K, V> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _schema: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> Collection<K, V>
where
    K: StoreKey,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    pub async fn get(&self, tx: &mut dyn Transaction, key: &K) -> Result<Option<V>> {
        self.read(tx, key, LockMode::Shared).await
    }

    pub async fn get_for_update(&self, tx: &mut dyn Transaction, key: &K) -> Result<Option<V>> {
        self.read(tx, key, LockMode::Update).await
    }

    async fn read(&self, tx: &mut dyn Transaction, key: &K, mode: LockMode) -> Result<Option<V>> {
        match tx.get(self.name, &key.encode(), mode).await? {
            Some(raw) => Ok(Some(serde_json::from_value(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, tx: &mut dyn Transaction, key: &K, value: &V) -> Result<()> {
        let raw = serde_json::to_value(value)?;
        tx.put(self.name, &key.encode(), raw).await
    }

    pub async fn contains_key(&self, tx: &mut dyn Transaction, key: &K) -> Result<bool> {
        tx.contains_key(self.name, &key.encode()).await
    }

    /// Entries with `start <= key < end`.
    pub async fn scan(
        &self,
        tx: &mut dyn Transaction,
        start: Option<&K>,
        end: Option<&K>,
    ) -> Result<Vec<(K, V)>> {
        self.scan_window(tx, start, end, 0, None).await
    }

    /// Like [`Collection::scan`], skipping `offset` entries and returning at
    /// most `limit`.
    pub async fn scan_window(
        &self,
        tx: &mut dyn Transaction,
        start: Option<&K>,
        end: Option<&K>,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<(K, V)>> {
        let range = KeyRange {
            start: start.map(StoreKey::encode),
            end: end.map(StoreKey::encode),
            offset,
            limit,
        };

        tx.scan(self.name, &range)
            .await?
            .into_iter()
            .map(|(raw_key, raw)| -> Result<(K, V)> {
                Ok((K::decode(&raw_key)?, serde_json::from_value(raw)?))
            })
            .collect()
    }
}

pub const IN_PROGRESS: Collection<String, DeviceEventSeries> = Collection::new("devices.in_progress");
pub const HISTORY: Collection<DateTime<Utc>, DeviceEventSeries> = Collection::new("devices.history");
pub const COUNTERS: Collection<String, EdgeDevice> = Collection::new("devices.counters");

/// Creates every collection the ingestion path touches.
pub async fn ensure_collections(store: &dyn TransactionalStore) -> Result<()> {
    for name in [IN_PROGRESS.name(), HISTORY.name(), COUNTERS.name()] {
        store.get_or_create_collection(name).await?;
    }
    Ok(())
}
