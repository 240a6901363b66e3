//! S3 Object Store Implementation
//!
//! Batches land in S3 (or MinIO / LocalStack) through the `object_store`
//! crate. The content type travels as an object attribute so downstream
//! readers see `text/plain`.

use crate::config::S3Config;
use crate::storage::{ObjectMeta, ObjectStore};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, Attributes, ObjectStore as ObjectStoreTrait, PutOptions, PutPayload};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;

#[derive(Clone)]
pub struct S3ObjectStore {
    store: Arc<dyn ObjectStoreTrait>,
    prefix: String,
}

impl S3ObjectStore {
    /// Build from config; credentials come from `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY`
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        builder = builder
            .with_access_key_id(std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default())
            .with_secret_access_key(std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
            prefix: config.prefix.clone(),
        })
    }

    /// Wrap an existing backend (e.g. `object_store::memory::InMemory` in tests)
    pub fn from_store(store: Arc<dyn ObjectStoreTrait>, prefix: String) -> Self {
        S3ObjectStore { store, prefix }
    }

    fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }

    fn strip_prefix(&self, path: &ObjectPath) -> String {
        let path_str = path.to_string();
        if self.prefix.is_empty() {
            return path_str;
        }
        let prefix_with_slash = format!("{}/", self.prefix);
        path_str
            .strip_prefix(&prefix_with_slash)
            .map(str::to_string)
            .unwrap_or(path_str)
    }

    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
        content_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            let payload = PutPayload::from(bytes::Bytes::copy_from_slice(data));
            self.store
                .put_opts(&self.full_path(key), payload, opts)
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn head<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<ObjectMeta>> + Send + 'a>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&self.full_path(key))
                .await
                .map_err(Self::map_error)?;
            let content_type = result
                .attributes
                .get(&Attribute::ContentType)
                .map(|v| v.to_string());
            Ok(ObjectMeta {
                key: key.to_string(),
                size_bytes: result.meta.size as u64,
                content_type,
            })
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = IoResult<Vec<ObjectMeta>>> + Send + 'a>> {
        Box::pin(async move {
            use futures::TryStreamExt;

            // object_store lists by whole path segments; filter the tail by string
            let dir = prefix.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
            let list_path = self.full_path(dir);
            let metas: Vec<object_store::ObjectMeta> = self
                .store
                .list(Some(&list_path))
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = metas
                .into_iter()
                .filter_map(|m| {
                    let key = self.strip_prefix(&m.location);
                    key.starts_with(prefix).then(|| ObjectMeta {
                        key,
                        size_bytes: m.size as u64,
                        content_type: None,
                    })
                })
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }
}
