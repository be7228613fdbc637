//! State store adapter
//!
//! A versioned key/value contract with three backends:
//!
//! - [`MemoryStore`]: process-local map, used directly or as the fallback
//! - [`SledStore`]: embedded durable store
//! - [`ResilientStore`]: wraps a durable backend and switches to memory, for
//!   the rest of the process lifetime, the first time the backend fails
//!
//! Every record carries a version. A write must name the version it expects
//! to replace (`0` for "must not exist yet") and the store assigns
//! `expected + 1` on success.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;

/// A stored value with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Value,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Versioned key/value store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs and health reports.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError>;

    /// Write `value` if the current version equals `expected_version`.
    /// Returns the new version.
    async fn put(&self, key: &str, value: Value, expected_version: u64) -> Result<u64, StoreError>;

    /// All records whose key starts with `prefix`, in key order.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError>;

    /// Delete a record if its version still equals `expected_version`.
    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), StoreError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, VersionedValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Overwrite `key` with a record read from or written to another store,
    /// version included. `None` drops it.
    pub fn mirror(&self, key: &str, record: Option<VersionedValue>) {
        let mut records = self.records.write();
        match record {
            Some(record) => {
                records.insert(key.to_string(), record);
            }
            None => {
                records.remove(key);
            }
        }
    }

    /// Replace everything under `prefix` with `found`.
    pub fn mirror_prefix(&self, prefix: &str, found: &[(String, VersionedValue)]) {
        let mut records = self.records.write();
        records.retain(|k, _| !k.starts_with(prefix));
        records.extend(found.iter().cloned());
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value, expected_version: u64) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let actual = records.get(key).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = expected_version + 1;
        records.insert(key.to_string(), VersionedValue { version, value });
        Ok(version)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let records = self.records.read();
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let actual = records.get(key).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        records.remove(key);
        Ok(())
    }
}

/// Durable store on top of sled.
///
/// Records are stored as JSON-encoded [`VersionedValue`]s; writes use sled's
/// compare-and-swap on the previous bytes so two processes sharing the tree
/// cannot both win the same version.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A store that is deleted when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<VersionedValue, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn encode(key: &str, record: &VersionedValue) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn version_of(key: &str, bytes: Option<&sled::IVec>) -> Result<u64, StoreError> {
        match bytes {
            Some(b) => Ok(Self::decode(key, b)?.version),
            None => Ok(0),
        }
    }
}

// Point reads and writes call sled inline on the runtime thread; they touch
// one key and return from the page cache. Prefix scans can walk the whole
// tree and run on the blocking pool.
#[async_trait]
impl StateStore for SledStore {
    fn backend(&self) -> &'static str {
        "sled"
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value, expected_version: u64) -> Result<u64, StoreError> {
        let current = self.db.get(key)?;
        let actual = Self::version_of(key, current.as_ref())?;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }

        let version = expected_version + 1;
        let encoded = Self::encode(key, &VersionedValue { version, value })?;
        match self.db.compare_and_swap(key, current.as_ref(), Some(encoded))? {
            Ok(()) => {
                self.db.flush_async().await?;
                Ok(version)
            }
            Err(cas) => Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: Self::version_of(key, cas.current.as_ref())?,
            }),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        let db = self.db.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<(String, VersionedValue)>, StoreError> {
            let mut out = Vec::new();
            for entry in db.scan_prefix(prefix.as_bytes()) {
                let (k, v) = entry?;
                let key = String::from_utf8_lossy(&k).into_owned();
                let record = Self::decode(&key, &v)?;
                out.push((key, record));
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sled scan aborted: {e}")))?
    }

    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), StoreError> {
        let current = self.db.get(key)?;
        let actual = Self::version_of(key, current.as_ref())?;
        if current.is_none() || actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        match self.db.compare_and_swap(key, current.as_ref(), None::<Vec<u8>>)? {
            Ok(()) => Ok(()),
            Err(cas) => Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: Self::version_of(key, cas.current.as_ref())?,
            }),
        }
    }
}

/// Durable store with an in-memory fallback.
///
/// Every record read from or written to the durable backend is mirrored in
/// memory under the same version. The first [`StoreError::Unavailable`]
/// flips the store into degraded mode: an error is logged, the degraded
/// signal fires and every later call, including the one that failed, is
/// served from the mirror. Work in flight continues from the last state
/// this process saw; records it never touched are not visible. There is no
/// automatic return to the durable backend.
pub struct ResilientStore {
    durable: Option<Arc<dyn StateStore>>,
    memory: MemoryStore,
    degraded: AtomicBool,
    signal: watch::Sender<Option<String>>,
}

impl ResilientStore {
    /// Wrap a durable backend.
    pub fn new(durable: Arc<dyn StateStore>) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            durable: Some(durable),
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            signal,
        }
    }

    /// Memory by configuration; never reported as degraded.
    pub fn memory_only() -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            durable: None,
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            signal,
        }
    }

    /// The durable backend could not be reached at startup.
    pub fn degraded(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!(%reason, "durable store unavailable at startup, running from memory");
        let (signal, _) = watch::channel(Some(reason));
        Self {
            durable: None,
            memory: MemoryStore::new(),
            degraded: AtomicBool::new(true),
            signal,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Receives `Some(reason)` once the store has fallen back to memory.
    pub fn degraded_signal(&self) -> watch::Receiver<Option<String>> {
        self.signal.subscribe()
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.signal.borrow().clone()
    }

    fn durable(&self) -> Option<&Arc<dyn StateStore>> {
        if self.is_degraded() {
            None
        } else {
            self.durable.as_ref()
        }
    }

    fn degrade(&self, backend: &str, reason: &str) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(backend, %reason, "durable store failed, falling back to in-memory store");
        self.signal.send_replace(Some(format!("{backend}: {reason}")));
    }
}

/// Run `$call` against the durable backend and feed a successful result to
/// `$mirror`; on `Unavailable`, degrade and run it against memory instead.
macro_rules! with_fallback {
    ($self:ident, $store:ident => $call:expr, mirror |$ok:ident| $mirror:expr) => {{
        if let Some($store) = $self.durable() {
            match $call.await {
                Err(StoreError::Unavailable(reason)) => {
                    $self.degrade($store.backend(), &reason);
                }
                other => {
                    if let Ok($ok) = &other {
                        $mirror;
                    }
                    return other;
                }
            }
        }
        let $store = &$self.memory;
        $call.await
    }};
}

#[async_trait]
impl StateStore for ResilientStore {
    fn backend(&self) -> &'static str {
        match self.durable() {
            Some(store) => store.backend(),
            None => self.memory.backend(),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>, StoreError> {
        with_fallback!(self, store => store.get(key), mirror |record| self.memory.mirror(key, record.clone()))
    }

    async fn put(&self, key: &str, value: Value, expected_version: u64) -> Result<u64, StoreError> {
        with_fallback!(
            self,
            store => store.put(key, value.clone(), expected_version),
            mirror |version| self.memory.mirror(
                key,
                Some(VersionedValue {
                    version: *version,
                    value: value.clone(),
                })
            )
        )
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>, StoreError> {
        with_fallback!(self, store => store.scan(prefix), mirror |found| self.memory.mirror_prefix(prefix, found))
    }

    async fn remove(&self, key: &str, expected_version: u64) -> Result<(), StoreError> {
        with_fallback!(self, store => store.remove(key, expected_version), mirror |_removed| self.memory.mirror(key, None))
    }
}

/// Build the store named by `config`, falling back to memory if the durable
/// backend cannot be opened.
pub fn open_store(config: &StoreConfig) -> ResilientStore {
    match config {
        StoreConfig::Memory => {
            debug!("using in-memory state store");
            ResilientStore::memory_only()
        }
        StoreConfig::Sled { path } => match SledStore::open(path) {
            Ok(store) => {
                info!(path = %path.display(), "opened sled state store");
                ResilientStore::new(Arc::new(store))
            }
            Err(e) => ResilientStore::degraded(format!("sled at {}: {e}", path.display())),
        },
    }
}
