//! Persistent key-value stores for scheduler state.
//!
//! Every store is a mapping from workflow id to a JSON-serialized value, kept in a
//! named collection of a [`StoreBackend`]. Writes are last-writer-wins per key.

use chrono::{DateTime, Utc};
use faultlens_core::{FaultLensError, Result, StorageBackendKind, StorageConfig, TriggerSignal};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::persistence::SqliteBackend;
use crate::schedule::ScheduleRecord;
use crate::workflow::AnalysisWorkflow;

pub const SCHEDULE_RECORDS: &str = "schedule_records";
pub const WORKFLOW_BODIES: &str = "workflow_bodies";
pub const PENDING_SIGNALS: &str = "pending_signals";

/// One serialized entry of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// Storage engine underneath the typed stores.
pub trait StoreBackend: Send + Sync {
    fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>>;
    fn put(&self, collection: &str, key: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()>;
    fn delete(&self, collection: &str, key: &str) -> Result<bool>;
    fn entries(&self, collection: &str) -> Result<Vec<StoredEntry>>;
    fn clear(&self, collection: &str) -> Result<()>;
    /// Remove entries last written before `cutoff` unless `keep` holds for their key;
    /// returns how many went.
    fn prune_older_than(
        &self,
        collection: &str,
        cutoff: DateTime<Utc>,
        keep: &dyn Fn(&str) -> bool,
    ) -> Result<usize>;
}

/// Open the backend selected by configuration.
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn StoreBackend>> {
    let dir = PathBuf::from(&config.path);
    let backend: Arc<dyn StoreBackend> = match config.backend {
        StorageBackendKind::Memory => Arc::new(MemoryBackend::new()),
        StorageBackendKind::Json => Arc::new(JsonFileBackend::new(&dir)?),
        StorageBackendKind::Sqlite => {
            std::fs::create_dir_all(&dir)?;
            Arc::new(SqliteBackend::open(&dir.join("faultlens.db"))?)
        }
    };
    tracing::info!("💾 State backend: {:?} at {}", config.backend, dir.display());
    Ok(backend)
}

// ─── In-memory backend ──────────────────────────────────────

type Collections = HashMap<String, BTreeMap<String, StoredEntry>>;

/// Process-local backend; state is lost on exit.
#[derive(Default)]
pub struct MemoryBackend {
    collections: Mutex<Collections>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
        let cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cols.get(collection).and_then(|c| c.get(key)).cloned())
    }

    fn put(&self, collection: &str, key: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()> {
        let mut cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        cols.entry(collection.to_string()).or_default().insert(
            key.to_string(),
            StoredEntry {
                key: key.to_string(),
                value: value.to_string(),
                updated_at,
            },
        );
        Ok(())
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        let mut cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cols
            .get_mut(collection)
            .is_some_and(|c| c.remove(key).is_some()))
    }

    fn entries(&self, collection: &str) -> Result<Vec<StoredEntry>> {
        let cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cols
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, collection: &str) -> Result<()> {
        let mut cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        cols.remove(collection);
        Ok(())
    }

    fn prune_older_than(
        &self,
        collection: &str,
        cutoff: DateTime<Utc>,
        keep: &dyn Fn(&str) -> bool,
    ) -> Result<usize> {
        let mut cols = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(c) = cols.get_mut(collection) else {
            return Ok(0);
        };
        let before = c.len();
        c.retain(|k, e| e.updated_at >= cutoff || keep(k));
        Ok(before - c.len())
    }
}

// ─── JSON file backend ──────────────────────────────────────

/// One pretty-printed JSON file per collection, easy to read and diff.
/// Files are rewritten on every change to their collection.
pub struct JsonFileBackend {
    dir: PathBuf,
    cache: Mutex<Collections>,
}

impl JsonFileBackend {
    /// Create a backend rooted at the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn file(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }

    /// A file that cannot be read or parsed is an error; it is never replaced by an
    /// empty collection.
    fn load(&self, collection: &str) -> Result<BTreeMap<String, StoredEntry>> {
        let file = self.file(collection);
        if !file.exists() {
            return Ok(BTreeMap::new());
        }
        let json = std::fs::read_to_string(&file).map_err(|e| {
            FaultLensError::storage(format!("Failed to read {}: {e}", file.display()))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            tracing::error!("❌ Corrupt state file {}: {e}", file.display());
            FaultLensError::storage(format!("Failed to parse {}: {e}", file.display()))
        })
    }

    fn save(&self, collection: &str, entries: &BTreeMap<String, StoredEntry>) -> Result<()> {
        let file = self.file(collection);
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&file, json)?;
        tracing::debug!("💾 Saved {} entries to {}", entries.len(), file.display());
        Ok(())
    }

    /// Run `f` against the cached collection, loading it from disk first if needed.
    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut BTreeMap<String, StoredEntry>) -> Result<T>,
    ) -> Result<T> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if !cache.contains_key(collection) {
            let loaded = self.load(collection)?;
            cache.insert(collection.to_string(), loaded);
        }
        match cache.get_mut(collection) {
            Some(entries) => f(entries),
            None => Err(FaultLensError::storage(format!("collection {collection} not loaded"))),
        }
    }
}

impl StoreBackend for JsonFileBackend {
    fn get(&self, collection: &str, key: &str) -> Result<Option<StoredEntry>> {
        self.with_collection(collection, |c| Ok(c.get(key).cloned()))
    }

    fn put(&self, collection: &str, key: &str, value: &str, updated_at: DateTime<Utc>) -> Result<()> {
        self.with_collection(collection, |c| {
            c.insert(
                key.to_string(),
                StoredEntry {
                    key: key.to_string(),
                    value: value.to_string(),
                    updated_at,
                },
            );
            self.save(collection, c)
        })
    }

    fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        self.with_collection(collection, |c| {
            if c.remove(key).is_some() {
                self.save(collection, c)?;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn entries(&self, collection: &str) -> Result<Vec<StoredEntry>> {
        self.with_collection(collection, |c| Ok(c.values().cloned().collect()))
    }

    fn clear(&self, collection: &str) -> Result<()> {
        self.with_collection(collection, |c| {
            c.clear();
            self.save(collection, c)
        })
    }

    fn prune_older_than(
        &self,
        collection: &str,
        cutoff: DateTime<Utc>,
        keep: &dyn Fn(&str) -> bool,
    ) -> Result<usize> {
        self.with_collection(collection, |c| {
            let before = c.len();
            c.retain(|k, e| e.updated_at >= cutoff || keep(k));
            let pruned = before - c.len();
            if pruned > 0 {
                self.save(collection, c)?;
            }
            Ok(pruned)
        })
    }
}

// ─── Typed stores ──────────────────────────────────────

/// How long entries of a store are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    #[default]
    KeepForever,
    /// Entries not written for this long are pruned.
    MaxAge(chrono::Duration),
}

/// Typed view of one collection, keyed by workflow id.
pub struct PersistentStore<V> {
    backend: Arc<dyn StoreBackend>,
    collection: &'static str,
    retention: RetentionPolicy,
    _value: PhantomData<fn() -> V>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn StoreBackend>, collection: &'static str, retention: RetentionPolicy) -> Self {
        Self {
            backend,
            collection,
            retention,
            _value: PhantomData,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn get(&self, key: &Uuid) -> Result<Option<V>> {
        match self.backend.get(self.collection, &key.to_string())? {
            Some(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Return the stored value, or persist and return `make()` if there is none.
    pub fn get_or_add(&self, key: &Uuid, make: impl FnOnce() -> Result<V>) -> Result<V> {
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }
        let value = make()?;
        self.persist(key, &value)?;
        Ok(value)
    }

    pub fn persist(&self, key: &Uuid, value: &V) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.backend
            .put(self.collection, &key.to_string(), &json, Utc::now())
    }

    pub fn delete(&self, key: &Uuid) -> Result<bool> {
        self.backend.delete(self.collection, &key.to_string())
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.clear(self.collection)
    }

    /// Every decodable entry. Undecodable entries are logged and skipped.
    pub fn snapshot(&self) -> Result<Vec<(Uuid, V)>> {
        let entries = self.backend.entries(self.collection)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let key = match Uuid::parse_str(&entry.key) {
                    Ok(k) => k,
                    Err(e) => {
                        tracing::warn!("⚠️ Bad key '{}' in {}: {e}", entry.key, self.collection);
                        return None;
                    }
                };
                match serde_json::from_str(&entry.value) {
                    Ok(v) => Some((key, v)),
                    Err(e) => {
                        tracing::warn!("⚠️ Undecodable entry {} in {}: {e}", key, self.collection);
                        None
                    }
                }
            })
            .collect())
    }

    /// Apply the retention policy as of `now`. Entries whose key satisfies `keep`
    /// survive regardless of age.
    pub fn prune_expired(&self, now: DateTime<Utc>, keep: impl Fn(&Uuid) -> bool) -> Result<usize> {
        match self.retention {
            RetentionPolicy::KeepForever => Ok(0),
            RetentionPolicy::MaxAge(age) => {
                let cutoff = now
                    .checked_sub_signed(age)
                    .ok_or_else(|| FaultLensError::invalid_argument("retention age out of range"))?;
                let keep_key =
                    |key: &str| Uuid::parse_str(key).is_ok_and(|id| keep(&id));
                self.backend.prune_older_than(self.collection, cutoff, &keep_key)
            }
        }
    }
}

/// Queued trigger signals per workflow id.
pub struct PendingSignalStore {
    inner: PersistentStore<VecDeque<TriggerSignal>>,
}

impl PendingSignalStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            inner: PersistentStore::new(backend, PENDING_SIGNALS, RetentionPolicy::KeepForever),
        }
    }

    pub fn get(&self, workflow_id: &Uuid) -> Result<VecDeque<TriggerSignal>> {
        Ok(self.inner.get(workflow_id)?.unwrap_or_default())
    }

    /// Replace the queue; an empty queue removes the entry.
    pub fn set(&self, workflow_id: &Uuid, queue: &VecDeque<TriggerSignal>) -> Result<()> {
        if queue.is_empty() {
            self.inner.delete(workflow_id)?;
            Ok(())
        } else {
            self.inner.persist(workflow_id, queue)
        }
    }

    pub fn get_all(&self) -> Result<Vec<(Uuid, VecDeque<TriggerSignal>)>> {
        self.inner.snapshot()
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}

/// The three stores the scheduler owns.
pub struct SchedulerStores {
    pub records: PersistentStore<ScheduleRecord>,
    pub workflows: PersistentStore<AnalysisWorkflow>,
    pub pending: PendingSignalStore,
}

impl SchedulerStores {
    pub fn new(backend: Arc<dyn StoreBackend>, workflow_retention: RetentionPolicy) -> Self {
        Self {
            records: PersistentStore::new(backend.clone(), SCHEDULE_RECORDS, RetentionPolicy::KeepForever),
            workflows: PersistentStore::new(backend.clone(), WORKFLOW_BODIES, workflow_retention),
            pending: PendingSignalStore::new(backend),
        }
    }

    /// Build stores from configuration.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let retention = config
            .retention()
            .map(RetentionPolicy::MaxAge)
            .unwrap_or_default();
        Ok(Self::new(open_backend(config)?, retention))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), RetentionPolicy::KeepForever)
    }

    pub fn clear_all(&self) -> Result<()> {
        self.records.clear()?;
        self.workflows.clear()?;
        self.pending.clear()
    }
}
