use ingestor::router::{route, PartitionKey};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfig {
    /// Lower-cased entity name.
    pub name: String,
    pub kind: EntityKind,
    pub partition_key: PartitionKey,
}

pub const DEFAULT_CAPACITY: usize = 100_000;

/// Known entities and their partition keys.
///
/// Names are case-insensitive, matching how the router hashes them. The
/// registry holds at most `capacity` entries; names beyond that are still
/// routed, just not cached.
#[derive(Debug)]
pub struct EntityRegistry {
    entities: RwLock<HashMap<String, EntityConfig>>,
    capacity: usize,
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Registers `name`, returning its entry. `None` when the name is new
    /// and the registry is full.
    pub fn register(&self, name: &str, kind: EntityKind) -> Option<EntityConfig> {
        let name = name.to_lowercase();
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entities.get(&name) {
            return Some(existing.clone());
        }
        if entities.len() >= self.capacity {
            return None;
        }

        let config = EntityConfig {
            partition_key: route(&name),
            name: name.clone(),
            kind,
        };
        entities.insert(name, config.clone());
        Some(config)
    }

    /// Returns false when the name was not registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase())
            .is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<EntityConfig> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
    }

    /// Partition key for `name`, from the registry when known.
    pub fn partition_key_for(&self, name: &str) -> PartitionKey {
        self.lookup(name).map_or_else(|| route(name), |config| config.partition_key)
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
