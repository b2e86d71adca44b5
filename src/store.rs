//! Durable signature index.
//!
//! [`SignatureStore`] maps table identifiers to their [`Signature`]. It is a
//! derived index: every entry can be rebuilt by re-classifying the table, so
//! a corrupt snapshot is logged and discarded rather than treated as fatal.
//!
//! Persistence is write-through. Every mutation rewrites the whole mapping via
//! the injected [`SnapshotBackend`]; if that write fails the in-memory change
//! is rolled back so memory and disk never disagree.
//!
//! # Snapshot format
//!
//! ```json
//! {
//!   "sales_q1.csv": { "column": "Region", "value": "North" },
//!   "merged_sales_q1.csv": { "column": "Region", "value": "North" }
//! }
//! ```
//!
//! Entries written as a two-element array (`["Region", "North"]`) are also
//! accepted on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::Signature;
use crate::table;

#[derive(Debug, Error)]
pub enum StoreIoError {
    #[error("failed to read signature snapshot {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write signature snapshot {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: table::TableError,
    },
    #[error("signature snapshot lock poisoned")]
    Poisoned,
    #[error("failed to serialize signature snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where the snapshot bytes live.
pub trait SnapshotBackend: Send + Sync {
    /// Returns `None` when no snapshot has been written yet.
    fn read(&self) -> Result<Option<Vec<u8>>, StoreIoError>;
    /// Replaces the snapshot. Must be atomic with respect to `read`.
    fn write(&self, bytes: &[u8]) -> Result<(), StoreIoError>;
}

/// JSON snapshot file, replaced by atomic rename on every write.
pub struct JsonFileSnapshot {
    path: PathBuf,
}

impl JsonFileSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotBackend for JsonFileSnapshot {
    fn read(&self) -> Result<Option<Vec<u8>>, StoreIoError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreIoError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<(), StoreIoError> {
        table::write_atomic(&self.path, bytes).map_err(|source| StoreIoError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// In-memory snapshot for tests and embedding. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySnapshot {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    /// Last bytes written, if any.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.lock().ok().and_then(|b| b.clone())
    }
}

impl SnapshotBackend for MemorySnapshot {
    fn read(&self) -> Result<Option<Vec<u8>>, StoreIoError> {
        Ok(self.contents())
    }

    fn write(&self, bytes: &[u8]) -> Result<(), StoreIoError> {
        let mut guard = self
            .bytes
            .lock()
            .map_err(|_| StoreIoError::Poisoned)?;
        *guard = Some(bytes.to_vec());
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotEntry {
    Object { column: String, value: String },
    Pair(String, String),
}

/// The identifier → signature index.
pub struct SignatureStore {
    entries: BTreeMap<String, Signature>,
    backend: Box<dyn SnapshotBackend>,
}

impl SignatureStore {
    /// Loads the snapshot from `backend`.
    ///
    /// A missing snapshot yields an empty store. A snapshot that cannot be
    /// parsed is logged and replaced by an empty store. Only an I/O failure
    /// reading an existing snapshot is an error.
    pub fn load(backend: Box<dyn SnapshotBackend>) -> Result<Self, StoreIoError> {
        let entries = match backend.read()? {
            None => BTreeMap::new(),
            Some(bytes) => decode_snapshot(&bytes),
        };
        info!("Loaded {} signature entries", entries.len());
        Ok(Self { entries, backend })
    }

    /// Convenience constructor for the JSON file backend.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreIoError> {
        Self::load(Box::new(JsonFileSnapshot::new(path)))
    }

    pub fn get(&self, identifier: &str) -> Option<&Signature> {
        self.entries.get(identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending identifier order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Signature)> {
        self.entries.iter()
    }

    /// Upserts and persists. On persist failure the previous state is restored.
    pub fn put(&mut self, identifier: &str, signature: Signature) -> Result<(), StoreIoError> {
        let previous = self.entries.insert(identifier.to_string(), signature);
        if let Err(e) = self.persist() {
            match previous {
                Some(old) => self.entries.insert(identifier.to_string(), old),
                None => self.entries.remove(identifier),
            };
            return Err(e);
        }
        debug!(identifier, "signature stored");
        Ok(())
    }

    /// Removes an entry if present. Absent identifiers are not an error.
    pub fn remove(&mut self, identifier: &str) -> Result<Option<Signature>, StoreIoError> {
        let Some(old) = self.entries.remove(identifier) else {
            return Ok(None);
        };
        if let Err(e) = self.persist() {
            self.entries.insert(identifier.to_string(), old);
            return Err(e);
        }
        Ok(Some(old))
    }

    /// Every other identifier whose stored column equals `column`, ignoring
    /// case and surrounding whitespace. Ascending identifier order.
    pub fn find_matches(&self, identifier: &str, column: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(id, sig)| id.as_str() != identifier && sig.same_column(column))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Pretty JSON of the whole mapping, as written to the snapshot.
    pub fn to_json(&self) -> Result<String, StoreIoError> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    fn persist(&self) -> Result<(), StoreIoError> {
        let json = self.to_json()?;
        self.backend.write(json.as_bytes())
    }
}

fn decode_snapshot(bytes: &[u8]) -> BTreeMap<String, Signature> {
    let raw: BTreeMap<String, SnapshotEntry> = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Signature snapshot is corrupt, starting empty: {}", e);
            return BTreeMap::new();
        }
    };

    let mut entries = BTreeMap::new();
    for (identifier, entry) in raw {
        let (column, value) = match entry {
            SnapshotEntry::Object { column, value } => (column, value),
            SnapshotEntry::Pair(column, value) => (column, value),
        };
        match Signature::new(&column, &value) {
            Some(sig) => {
                entries.insert(identifier, sig);
            }
            None => warn!(identifier = %identifier, "Skipping snapshot entry with empty column"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sig(column: &str, value: &str) -> Signature {
        Signature::new(column, value).unwrap()
    }

    fn memory_store() -> (SignatureStore, MemorySnapshot) {
        let snap = MemorySnapshot::new();
        let store = SignatureStore::load(Box::new(snap.clone())).unwrap();
        (store, snap)
    }

    #[test]
    fn test_put_twice_is_idempotent() {
        let (mut store, snap) = memory_store();
        store.put("a.csv", sig("Region", "North")).unwrap();
        let once = snap.contents().unwrap();
        store.put("a.csv", sig("Region", "North")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(snap.contents().unwrap(), once);
    }

    #[test]
    fn test_put_overwrites_latest_wins() {
        let (mut store, _snap) = memory_store();
        store.put("a.csv", sig("Region", "North")).unwrap();
        store.put("a.csv", sig("Product", "Bolt")).unwrap();
        assert_eq!(store.get("a.csv"), Some(&sig("Product", "Bolt")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (mut store, _snap) = memory_store();
        store.put("a.csv", sig("Region", "North")).unwrap();
        assert!(store.remove("a.csv").unwrap().is_some());
        assert!(store.remove("a.csv").unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_find_matches_is_case_insensitive_and_symmetric() {
        let (mut store, _snap) = memory_store();
        store.put("a.csv", sig("Region", "North")).unwrap();
        store.put("b.csv", sig(" REGION", "South")).unwrap();
        store.put("c.csv", sig("Product", "Bolt")).unwrap();

        assert_eq!(store.find_matches("a.csv", "Region"), vec!["b.csv"]);
        assert_eq!(store.find_matches("b.csv", "REGION"), vec!["a.csv"]);
        assert!(store.find_matches("c.csv", "Product").is_empty());
    }

    #[test]
    fn test_find_matches_order_is_stable() {
        let (mut store, _snap) = memory_store();
        for id in ["z.csv", "m.csv", "a.csv", "q.csv"] {
            store.put(id, sig("Region", id)).unwrap();
        }
        assert_eq!(
            store.find_matches("m.csv", "region"),
            vec!["a.csv", "q.csv", "z.csv"]
        );
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let snap = MemorySnapshot::with_contents(b"{ not json".to_vec());
        let store = SignatureStore::load(Box::new(snap)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_legacy_pair_entries_are_accepted() {
        let snap = MemorySnapshot::with_contents(
            br#"{"a.csv": ["Region", " North "], "b.csv": {"column": "Region", "value": "South"}, "c.csv": ["", "x"]}"#
                .to_vec(),
        );
        let store = SignatureStore::load(Box::new(snap)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("a.csv"), Some(&sig("Region", "North")));
    }

    #[test]
    fn test_file_snapshot_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("output").join("matches.json");
        {
            let mut store = SignatureStore::open(&path).unwrap();
            assert!(store.is_empty());
            store.put("a.csv", sig("Region", "North")).unwrap();
        }
        let store = SignatureStore::open(&path).unwrap();
        assert_eq!(store.get("a.csv"), Some(&sig("Region", "North")));

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["a.csv"]["column"], "Region");
    }

    struct FailingSnapshot;

    impl SnapshotBackend for FailingSnapshot {
        fn read(&self) -> Result<Option<Vec<u8>>, StoreIoError> {
            Ok(None)
        }
        fn write(&self, _bytes: &[u8]) -> Result<(), StoreIoError> {
            let path = PathBuf::from("matches.json");
            Err(StoreIoError::Write {
                path: path.clone(),
                source: table::TableError::Write {
                    path,
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                },
            })
        }
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let mut store = SignatureStore::load(Box::new(FailingSnapshot)).unwrap();
        assert!(store.put("a.csv", sig("Region", "North")).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_error_keeps_source_chain() {
        use std::error::Error as _;

        struct BlankRead(JsonFileSnapshot);

        impl SnapshotBackend for BlankRead {
            fn read(&self) -> Result<Option<Vec<u8>>, StoreIoError> {
                Ok(None)
            }
            fn write(&self, bytes: &[u8]) -> Result<(), StoreIoError> {
                self.0.write(bytes)
            }
        }

        let tmp = tempfile::TempDir::new().unwrap();
        // a directory sits where the snapshot file should be renamed to
        let path = tmp.path().join("matches.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let mut store =
            SignatureStore::load(Box::new(BlankRead(JsonFileSnapshot::new(&path)))).unwrap();
        let err = store.put("a.csv", sig("Region", "North")).unwrap_err();
        assert!(matches!(err, StoreIoError::Write { .. }));
        let source = err.source().expect("write error has a source");
        assert!(source.downcast_ref::<table::TableError>().is_some());
        assert!(store.is_empty());
    }
}
