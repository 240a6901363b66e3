//! Bulk Object Store Abstraction
//!
//! Flushed batches are written once under path-like keys
//! (`logs/{domain}/{timestamp}-{suffix}.log`) and never rewritten.
//!
//! Implementations:
//! - `InMemoryObjectStore`: unit tests and DST
//! - `LocalFsObjectStore`: development and single-node deployments
//! - `S3ObjectStore`: production (feature `s3`)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

pub const CONTENT_TYPE_TEXT_PLAIN: &str = "text/plain";

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: u64,
    /// Content type recorded at put time, when the backend keeps one
    pub content_type: Option<String>,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Write an object (create or overwrite)
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Get an object's contents
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>>;

    /// Get object metadata without downloading content
    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ObjectMeta>> + Send + 'a>>;

    /// List objects with a prefix, sorted by key
    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>>;
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// In-memory object store for unit tests and deterministic simulation
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let obj = StoredObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            };
            self.data.write().insert(key.to_string(), obj);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ObjectMeta>> + Send + 'a>> {
        Box::pin(async move {
            self.data
                .read()
                .get(key)
                .map(|obj| ObjectMeta {
                    key: key.to_string(),
                    size_bytes: obj.data.len() as u64,
                    content_type: Some(obj.content_type.clone()),
                })
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>> {
        Box::pin(async move {
            let data = self.data.read();
            let mut objects: Vec<ObjectMeta> = data
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.data.len() as u64,
                    content_type: Some(v.content_type.clone()),
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store
///
/// Keys map directly to relative paths under `base_path`. The content type
/// lives in a `{file}.meta` JSON sidecar next to each object.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

const SIDECAR_SUFFIX: &str = ".meta";

#[derive(Debug, Serialize, Deserialize)]
struct SidecarMeta {
    content_type: String,
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Missing or unreadable sidecars read as no content type
fn parse_sidecar(bytes: &[u8]) -> Option<String> {
    serde_json::from_slice::<SidecarMeta>(bytes)
        .ok()
        .map(|meta| meta.content_type)
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key, refusing anything that would escape `base_path`
    fn full_path(&self, key: &str) -> IoResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if key.is_empty() || escapes {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("invalid object key: {:?}", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Sidecar first: a visible object always has its metadata
            let meta = serde_json::to_vec(&SidecarMeta {
                content_type: content_type.to_string(),
            })
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
            tokio::fs::write(sidecar_path(&path), meta).await?;

            // Write to a temp name then rename, so readers never see a torn batch
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, data).await?;
            tokio::fs::rename(&tmp, &path).await
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            tokio::fs::read(&path).await
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ObjectMeta>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key)?;
            let metadata = tokio::fs::metadata(&path).await?;
            let content_type = tokio::fs::read(sidecar_path(&path))
                .await
                .ok()
                .and_then(|bytes| parse_sidecar(&bytes));
            Ok(ObjectMeta {
                key: key.to_string(),
                size_bytes: metadata.len(),
                content_type,
            })
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                if base.exists() {
                    walk_dir(&base, &base, &prefix, &mut objects)?;
                }
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok::<_, IoError>(objects)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e))?
        })
    }
}

fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(&path, base, prefix, objects)?;
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "tmp")
            || path.to_string_lossy().ends_with(SIDECAR_SUFFIX)
        {
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            objects.push(ObjectMeta {
                key,
                size_bytes: std::fs::metadata(&path)?.len(),
                content_type: std::fs::read(sidecar_path(&path))
                    .ok()
                    .and_then(|bytes| parse_sidecar(&bytes)),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_put_get() {
        let store = InMemoryObjectStore::new();

        store
            .put("logs/a.com/1.log", b"hello world", CONTENT_TYPE_TEXT_PLAIN)
            .await
            .unwrap();
        let data = store.get("logs/a.com/1.log").await.unwrap();

        assert_eq!(data, b"hello world");
        let meta = store.head("logs/a.com/1.log").await.unwrap();
        assert_eq!(meta.size_bytes, 11);
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_inmemory_missing_key() {
        let store = InMemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_inmemory_list_prefix() {
        let store = InMemoryObjectStore::new();

        store.put("logs/b.com/2.log", b"2", "text/plain").await.unwrap();
        store.put("logs/b.com/1.log", b"1", "text/plain").await.unwrap();
        store.put("logs/c.com/1.log", b"3", "text/plain").await.unwrap();

        let listed = store.list("logs/b.com/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/b.com/1.log", "logs/b.com/2.log"]);
    }

    #[tokio::test]
    async fn test_localfs_put_get_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        store
            .put("logs/a.com/2024-01-01T00:00:00.000Z-abcde.log", b"line", "text/plain")
            .await
            .unwrap();
        store.put("logs/b.com/x.log", b"other", "text/plain").await.unwrap();

        let data = store
            .get("logs/a.com/2024-01-01T00:00:00.000Z-abcde.log")
            .await
            .unwrap();
        assert_eq!(data, b"line");

        let listed = store.list("logs/a.com/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "logs/a.com/2024-01-01T00:00:00.000Z-abcde.log");
        assert_eq!(listed[0].size_bytes, 4);
        assert_eq!(listed[0].content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_localfs_keeps_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        store
            .put("logs/a.com/1.log", b"line", CONTENT_TYPE_TEXT_PLAIN)
            .await
            .unwrap();
        store.put("logs/a.com/2.bin", b"\x00", "application/octet-stream").await.unwrap();

        let meta = store.head("logs/a.com/1.log").await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("text/plain"));

        // Survives a reopen; sidecars never show up as objects
        let reopened = LocalFsObjectStore::new(dir.path().to_path_buf());
        let listed = reopened.list("logs/a.com/").await.unwrap();
        let types: Vec<(&str, Option<&str>)> = listed
            .iter()
            .map(|m| (m.key.as_str(), m.content_type.as_deref()))
            .collect();
        assert_eq!(
            types,
            vec![
                ("logs/a.com/1.log", Some("text/plain")),
                ("logs/a.com/2.bin", Some("application/octet-stream")),
            ]
        );

        // An object written without a sidecar still lists
        std::fs::write(dir.path().join("logs/a.com/3.log"), b"bare").unwrap();
        let bare = reopened.head("logs/a.com/3.log").await.unwrap();
        assert_eq!(bare.content_type, None);
    }

    #[tokio::test]
    async fn test_localfs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        let err = store.put("../evil.log", b"x", "text/plain").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = store.put("/abs.log", b"x", "text/plain").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_localfs_list_missing_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path().join("never-created"));
        assert!(store.list("logs/").await.unwrap().is_empty());
    }
}
