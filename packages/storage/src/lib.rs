//! Object storage backend for work item stores.
//!
//! Each named store is a directory of JSON objects, one per key:
//! - S3-compatible storage in production/staging
//! - On-disk storage for local dev
//! - In-memory storage for tests
//!
//! Entry tags are the object ETags reported by `object_store`, and
//! conditional writes map onto its `PutMode` preconditions.

mod config;
mod dictionary;

use std::sync::Arc;

use object_store::ObjectStore;
use object_store::path::Path;
use queue_core::{DictionaryError, DictionaryProvider};

pub use config::{S3Config, StorageBackendConfig, StorageConfig, StorageKind};
pub use dictionary::BlobDictionary;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for DictionaryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(key) => DictionaryError::InvalidKey(key),
            StorageError::Json(e) => DictionaryError::Serialization(e),
            other => DictionaryError::Backend(other.to_string()),
        }
    }
}

/// Opens [`BlobDictionary`] stores on one object store.
#[derive(Clone)]
pub struct BlobDictionaryProvider {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl BlobDictionaryProvider {
    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store): (StorageKind, Arc<dyn ObjectStore>) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (StorageKind::S3, Arc::new(config::build_s3(s3)?) as _),
            StorageBackendConfig::Filesystem { root } => {
                std::fs::create_dir_all(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs) as _)
            }
            StorageBackendConfig::Memory => (
                StorageKind::Memory,
                Arc::new(object_store::memory::InMemory::new()) as _,
            ),
        };

        tracing::info!(backend = kind.as_str(), "Opened blob storage");

        Ok(Self {
            kind,
            store,
            prefix: cfg.prefix.and_then(config::non_empty),
        })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    fn store_root(&self, name: &str) -> Result<Path, StorageError> {
        let name = dictionary::validate_segment(name, "store name")?;
        let joined = match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{name}"),
            _ => name.to_string(),
        };
        Ok(Path::from(joined))
    }
}

impl DictionaryProvider for BlobDictionaryProvider {
    type Dictionary = BlobDictionary;

    async fn open(&self, name: &str) -> Result<BlobDictionary, DictionaryError> {
        let root = self.store_root(name)?;
        Ok(BlobDictionary::new(self.store.clone(), root))
    }
}
