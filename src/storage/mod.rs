//! Storage Collaborators
//!
//! The buffer engine talks to two stores:
//!
//! ```text
//! BufferActor ──► ObjectStore   (flushed batches, write-once)
//!      │
//!      └───────► StateStore    (domain, lastFlushAt, nextScheduledFlush, alarms)
//! ```

pub mod object_store;
pub mod simulated_store;
pub mod state_store;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use object_store::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore, CONTENT_TYPE_TEXT_PLAIN,
};
pub use simulated_store::{
    SimulatedObjectStore, SimulatedStateStore, SimulatedStoreConfig, SimulatedStoreStats,
};
pub use state_store::{ActorState, InMemoryStateStore, LocalFsStateStore, StateStore};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;

use crate::config::{BulkStoreKind, StateStoreKind, StorageConfig};
use std::io::Result as IoResult;
use std::sync::Arc;

/// Bulk store selected by `storage.bulk`
pub fn open_bulk_store(config: &StorageConfig) -> IoResult<Arc<dyn ObjectStore>> {
    match config.bulk {
        BulkStoreKind::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        BulkStoreKind::LocalFs => Ok(Arc::new(LocalFsObjectStore::new(config.objects_path()))),
        #[cfg(feature = "s3")]
        BulkStoreKind::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing [storage.s3] section")
            })?;
            Ok(Arc::new(S3ObjectStore::new(s3)?))
        }
        #[cfg(not(feature = "s3"))]
        BulkStoreKind::S3 => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "s3 bulk store requires the `s3` feature",
        )),
    }
}

/// State store selected by `storage.state`
pub fn open_state_store(config: &StorageConfig) -> Arc<dyn StateStore> {
    match config.state {
        StateStoreKind::Memory => Arc::new(InMemoryStateStore::new()),
        StateStoreKind::LocalFs => Arc::new(LocalFsStateStore::new(config.state_path())),
    }
}
