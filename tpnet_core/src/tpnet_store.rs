//! Persistence of the node network inside the world save.
//!
//! The network is one opaque blob under a single key (`TPNetData` by
//! default). The current format is a JSON array of [`NodeSnapshot`]. Older
//! saves hold a JSON object mapping `"x,y,z"` to a [`LegacyRecord`]; those
//! are still read, but never written.

use crate::tpnet_node::{BlockPos, Node, NodeSnapshot, ParsePosError, PlayerUid};
use crate::tpnet_registry::NodeRegistry;

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to encode network: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid legacy key: {0}")]
    InvalidKey(#[from] ParsePosError),

    #[error("Saved network is unreadable (current format: {current}; legacy format: {legacy})")]
    Corrupt { current: String, legacy: String },
}

impl StoreError {
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        StoreError::Storage(msg.to_string())
    }
}

/// Byte blobs by key, provided by the host's world save.
pub trait SaveStore: Send + Sync {
    fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn store_data(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;
}

/// In-memory store, for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemorySaveStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySaveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaveStore for MemorySaveStore {
    fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn store_data(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// Sled-backed store for a world save on disk.
pub struct SledSaveStore {
    db: sled::Db,
}

impl SledSaveStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, deleted on drop
    pub fn open_temp() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl SaveStore for SledSaveStore {
    fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .db
            .get(key)
            .map_err(|e| StoreError::storage(format!("Read failed: {}", e)))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    fn store_data(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key, data)
            .map_err(|e| StoreError::storage(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::storage(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// Node record as written by older saves.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyRecord {
    #[serde(default, alias = "Name")]
    pub name: String,

    #[serde(default, alias = "Available")]
    pub available: bool,

    #[serde(default, rename = "activatedBy", alias = "ActivatedBy")]
    pub activated_by: Vec<PlayerUid>,
}

/// Result of [`load_network`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Nodes inserted into the registry
    pub loaded: usize,

    /// Whether the blob was in the legacy format
    pub legacy: bool,
}

/// Writes every registered node under `key`. Returns the number saved.
pub fn save_network(
    registry: &NodeRegistry,
    store: &dyn SaveStore,
    key: &str,
) -> Result<usize, StoreError> {
    let snapshots: Vec<NodeSnapshot> = registry.list_all().into_iter().map(NodeSnapshot::from).collect();
    let data = serde_json::to_vec(&snapshots)?;
    store.store_data(key, &data)?;
    debug!("Saved {} nodes under {}", snapshots.len(), key);
    Ok(snapshots.len())
}

/// Reads the blob under `key` into `registry`.
///
/// A missing blob loads nothing. A blob that fails to decode in the current
/// format is retried as legacy; if that fails too the error carries both
/// decode messages.
pub fn load_network(
    registry: &NodeRegistry,
    store: &dyn SaveStore,
    key: &str,
) -> Result<LoadSummary, StoreError> {
    info!("Loading teleport network from {}", key);

    let Some(data) = store.get_data(key)? else {
        info!("No saved teleport network");
        return Ok(LoadSummary::default());
    };

    let summary = match serde_json::from_slice::<Vec<NodeSnapshot>>(&data) {
        Ok(snapshots) => {
            let loaded = snapshots.len();
            for snapshot in snapshots {
                debug!("Loaded node {} ({})", snapshot.pos, snapshot.name);
                registry.set(Node::from(snapshot));
            }
            LoadSummary { loaded, legacy: false }
        }
        Err(current) => {
            debug!("Current format rejected ({}), trying legacy format", current);
            let records: BTreeMap<String, LegacyRecord> = serde_json::from_slice(&data)
                .map_err(|legacy| StoreError::Corrupt {
                    current: current.to_string(),
                    legacy: legacy.to_string(),
                })?;
            let loaded = load_legacy(registry, records);
            LoadSummary { loaded, legacy: true }
        }
    };

    info!("Teleport network loaded: {} nodes", summary.loaded);
    Ok(summary)
}

fn load_legacy(registry: &NodeRegistry, records: BTreeMap<String, LegacyRecord>) -> usize {
    let mut loaded = 0;

    for (key, record) in records {
        let pos = match key.parse::<BlockPos>() {
            Ok(pos) => pos,
            Err(e) => {
                warn!("Skipping legacy record: {}", StoreError::from(e));
                continue;
            }
        };

        let mut node = registry.get_or_create(pos, record.available);
        node.name = record.name;
        node.activated_by = record.activated_by.into_iter().collect();

        debug!("Loaded legacy node {} ({})", pos, node.name);
        registry.set(node);
        loaded += 1;
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;

    const KEY: &str = "TPNetData";

    #[test]
    fn test_missing_blob_loads_nothing() {
        let registry = NodeRegistry::default();
        let summary = load_network(&registry, &MemorySaveStore::new(), KEY).unwrap();
        assert_eq!(summary, LoadSummary::default());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_save_then_load_restores_nodes() {
        let store = MemorySaveStore::new();
        let registry = NodeRegistry::default();
        let a = registry.get_or_create(BlockPos::new(1, 2, 3), true);
        registry.set(a.with_name("Alpha"));
        registry.get_or_create(BlockPos::new(40, 2, 3), true);
        registry.activate_for(BlockPos::new(1, 2, 3), &PlayerUid::new("u1"));

        assert_eq!(save_network(&registry, &store, KEY).unwrap(), 2);

        let restored = NodeRegistry::default();
        let summary = load_network(&restored, &store, KEY).unwrap();
        assert_eq!(summary, LoadSummary { loaded: 2, legacy: false });
        assert_eq!(restored.list_all(), registry.list_all());
    }

    #[test]
    fn test_legacy_blob_is_migrated() {
        let store = MemorySaveStore::new();
        store
            .store_data(
                KEY,
                br#"{"1,2,3": {"name": "Alpha", "available": true, "activatedBy": ["u1"]}}"#,
            )
            .unwrap();

        let registry = NodeRegistry::new(RegistryConfig::mirror());
        let summary = load_network(&registry, &store, KEY).unwrap();
        assert_eq!(summary, LoadSummary { loaded: 1, legacy: true });

        let node = registry.get(BlockPos::new(1, 2, 3)).unwrap();
        assert_eq!(node.name, "Alpha");
        assert!(node.enabled);
        assert!(node.is_activated_by(&PlayerUid::new("u1")));
        assert_eq!(node.neighbours, vec![None; 4]);
    }

    #[test]
    fn test_legacy_load_keeps_existing_record() {
        let store = MemorySaveStore::new();
        store
            .store_data(
                KEY,
                br#"{"0,0,0": {"name": "Alpha", "available": true, "activatedBy": ["u1"]}}"#,
            )
            .unwrap();

        let registry = NodeRegistry::default();
        registry.get_or_create(BlockPos::new(0, 0, 0), false);
        registry.get_or_create(BlockPos::new(9, 0, 0), true);
        let before = registry.get(BlockPos::new(0, 0, 0)).unwrap();

        load_network(&registry, &store, KEY).unwrap();

        let node = registry.get(BlockPos::new(0, 0, 0)).unwrap();
        assert_eq!(node.name, "Alpha");
        assert!(node.is_activated_by(&PlayerUid::new("u1")));
        assert!(!node.enabled);
        assert_eq!(node.neighbours, before.neighbours);
    }

    #[test]
    fn test_legacy_accepts_capitalized_fields_and_skips_bad_keys() {
        let store = MemorySaveStore::new();
        store
            .store_data(
                KEY,
                br#"{"4,5,6": {"Name": "Beta", "Available": false, "ActivatedBy": []}, "oops": {}}"#,
            )
            .unwrap();

        let registry = NodeRegistry::default();
        let summary = load_network(&registry, &store, KEY).unwrap();
        assert_eq!(summary.loaded, 1);
        let node = registry.get(BlockPos::new(4, 5, 6)).unwrap();
        assert_eq!(node.name, "Beta");
        assert!(!node.enabled);
    }

    #[test]
    fn test_garbage_blob_is_corrupt() {
        let store = MemorySaveStore::new();
        store.store_data(KEY, b"\x00\x01not json").unwrap();

        let registry = NodeRegistry::default();
        let err = load_network(&registry, &store, KEY).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sled_store_roundtrip() {
        let store = SledSaveStore::open_temp().unwrap();
        assert!(store.get_data(KEY).unwrap().is_none());

        let registry = NodeRegistry::default();
        registry.get_or_create(BlockPos::new(0, 0, 0), true);
        save_network(&registry, &store, KEY).unwrap();

        let restored = NodeRegistry::default();
        load_network(&restored, &store, KEY).unwrap();
        assert!(restored.contains(BlockPos::new(0, 0, 0)));
    }
}
