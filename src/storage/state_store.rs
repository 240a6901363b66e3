//! Key-Value State Store
//!
//! Holds the small per-actor records that must outlive the process: the
//! [`ActorState`] fields and the pending durable-timer alarm. Buffered log
//! lines are never written here.
//!
//! Implementations:
//! - `InMemoryStateStore`: tests and DST (survives actor eviction, not the process)
//! - `LocalFsStateStore`: one JSON document per actor key

use crate::clock::Timestamp;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

/// Persisted per-actor fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorState {
    pub domain: Option<String>,
    /// Epoch milliseconds of the last trigger-driven flush
    pub last_flush_at: Option<u64>,
    /// Epoch milliseconds the durable timer is next due
    pub next_scheduled_flush: Option<u64>,
}

impl ActorState {
    pub fn last_flush_at(&self) -> Option<Timestamp> {
        self.last_flush_at.map(Timestamp::from_millis)
    }

    pub fn next_scheduled_flush(&self) -> Option<Timestamp> {
        self.next_scheduled_flush.map(Timestamp::from_millis)
    }
}

/// On-disk / in-memory record for one actor key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    #[serde(default)]
    state: ActorState,
    /// Pending durable-timer alarm, epoch milliseconds
    #[serde(default)]
    alarm_at: Option<u64>,
}

/// Persistence for actor fields and alarms
pub trait StateStore: Send + Sync + 'static {
    /// Load an actor's fields; `Ok(None)` if the key was never stored
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<ActorState>>> + Send + 'a>>;

    fn save<'a>(
        &'a self,
        key: &'a str,
        state: &'a ActorState,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Set or clear the pending alarm for a key
    fn save_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Every key with a pending alarm
    fn list_alarms<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<(String, Timestamp)>>> + Send + 'a>>;
}

// ============================================================================
// InMemoryStateStore
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous peek for tests and invariant checks
    pub fn snapshot(&self, key: &str) -> Option<ActorState> {
        self.records.read().get(key).map(|r| r.state.clone())
    }

    pub fn alarm(&self, key: &str) -> Option<Timestamp> {
        self.records
            .read()
            .get(key)
            .and_then(|r| r.alarm_at)
            .map(Timestamp::from_millis)
    }
}

impl StateStore for InMemoryStateStore {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<ActorState>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.snapshot(key)) })
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        state: &'a ActorState,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.records
                .write()
                .entry(key.to_string())
                .or_default()
                .state = state.clone();
            Ok(())
        })
    }

    fn save_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.records
                .write()
                .entry(key.to_string())
                .or_default()
                .alarm_at = at.map(|t| t.as_millis());
            Ok(())
        })
    }

    fn list_alarms<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<(String, Timestamp)>>> + Send + 'a>> {
        Box::pin(async move {
            let mut alarms: Vec<(String, Timestamp)> = self
                .records
                .read()
                .iter()
                .filter_map(|(k, r)| r.alarm_at.map(|at| (k.clone(), Timestamp::from_millis(at))))
                .collect();
            alarms.sort();
            Ok(alarms)
        })
    }
}

// ============================================================================
// LocalFsStateStore
// ============================================================================

/// One JSON document per actor key under `base_path`
///
/// Keys are domains, which may contain characters unsafe in file names, so
/// file names are the percent-encoded key.
#[derive(Debug, Clone)]
pub struct LocalFsStateStore {
    base_path: PathBuf,
    /// Serializes read-modify-write of records from the actor and the timer
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

const RECORD_EXTENSION: &str = "json";

impl LocalFsStateStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsStateStore {
            base_path,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.base_path.join(format!("{}.{}", encoded, RECORD_EXTENSION))
    }

    async fn read_record(&self, key: &str) -> IoResult<Option<StoredRecord>> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| IoError::new(ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_record(&self, key: &str, record: &StoredRecord) -> IoResult<()> {
        tokio::fs::create_dir_all(&self.base_path).await?;
        let path = self.record_path(key);
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(record).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn update<F>(&self, key: &str, f: F) -> IoResult<()>
    where
        F: FnOnce(&mut StoredRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_record(key).await?.unwrap_or_default();
        f(&mut record);
        self.write_record(key, &record).await
    }
}

impl StateStore for LocalFsStateStore {
    fn load<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Option<ActorState>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.read_record(key).await?.map(|r| r.state)) })
    }

    fn save<'a>(
        &'a self,
        key: &'a str,
        state: &'a ActorState,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let state = state.clone();
            self.update(key, move |r| r.state = state).await
        })
    }

    fn save_alarm<'a>(
        &'a self,
        key: &'a str,
        at: Option<Timestamp>,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.update(key, move |r| r.alarm_at = at.map(|t| t.as_millis()))
                .await
        })
    }

    fn list_alarms<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<(String, Timestamp)>>> + Send + 'a>> {
        Box::pin(async move {
            let mut alarms = Vec::new();
            let mut entries = match tokio::fs::read_dir(&self.base_path).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(alarms),
                Err(e) => return Err(e),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let key: String = url::form_urlencoded::parse(format!("k={}", stem).as_bytes())
                    .map(|(_, v)| v.into_owned())
                    .next()
                    .unwrap_or_default();
                if let Some(record) = self.read_record(&key).await? {
                    if let Some(at) = record.alarm_at {
                        alarms.push((key, Timestamp::from_millis(at)));
                    }
                }
            }
            alarms.sort();
            Ok(alarms)
        })
    }
}
