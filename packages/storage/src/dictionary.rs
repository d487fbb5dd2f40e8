use std::sync::Arc;

use bytes::Bytes;
use futures_util::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutMode, PutOptions, PutPayload, UpdateVersion};
use queue_core::{DictionaryError, ETag, PersistentDictionary, Versioned, WriteCondition};

use crate::StorageError;

const SUFFIX: &str = ".json";

/// Keys and store names become single path segments, so they are limited
/// to characters that need no escaping.
pub(crate) fn validate_segment<'a>(value: &'a str, what: &str) -> Result<&'a str, StorageError> {
    let valid = !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value)
    } else {
        Err(StorageError::InvalidKey(format!("unsupported {what}: {value:?}")))
    }
}

/// One store: a directory of `<key>.json` objects.
#[derive(Clone)]
pub struct BlobDictionary {
    store: Arc<dyn ObjectStore>,
    root: Path,
}

impl BlobDictionary {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, root: Path) -> Self {
        Self { store, root }
    }

    fn path(&self, key: &str) -> Result<Path, StorageError> {
        let key = validate_segment(key, "key")?;
        Ok(self.root.child(format!("{key}{SUFFIX}")))
    }

    fn conflict(key: &str) -> DictionaryError {
        DictionaryError::Conflict {
            key: key.to_string(),
        }
    }

    async fn put(&self, path: &Path, bytes: Bytes, mode: PutMode) -> Result<ETag, StorageError> {
        let result = self
            .store
            .put_opts(path, PutPayload::from(bytes), PutOptions::from(mode))
            .await?;
        Ok(ETag(result.e_tag.unwrap_or_default()))
    }

    /// Compare-then-write for stores without native conditional updates.
    async fn put_if_current(
        &self,
        key: &str,
        path: &Path,
        bytes: Bytes,
        expected: &ETag,
    ) -> Result<ETag, DictionaryError> {
        let current = match self.store.head(path).await {
            Ok(meta) => meta.e_tag,
            Err(object_store::Error::NotFound { .. }) => return Err(Self::conflict(key)),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        if current.as_deref() != Some(expected.as_str()) {
            return Err(Self::conflict(key));
        }
        Ok(self.put(path, bytes, PutMode::Overwrite).await?)
    }
}

impl PersistentDictionary for BlobDictionary {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, DictionaryError> {
        let path = self.path(key)?;
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(StorageError::from(e).into()),
        };
        let etag = ETag(result.meta.e_tag.clone().unwrap_or_default());
        let bytes = result.bytes().await.map_err(StorageError::from)?;
        Ok(Some(Versioned {
            value: serde_json::from_slice(&bytes)?,
            etag,
        }))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<ETag, DictionaryError> {
        let path = self.path(key)?;
        let bytes = Bytes::from(serde_json::to_vec(&value)?);

        let mode = match &condition {
            WriteCondition::Any => PutMode::Overwrite,
            WriteCondition::Absent => PutMode::Create,
            WriteCondition::Matches(expected) => PutMode::Update(UpdateVersion {
                e_tag: Some(expected.to_string()),
                version: None,
            }),
        };

        match self.put(&path, bytes.clone(), mode).await {
            Ok(etag) => Ok(etag),
            Err(StorageError::ObjectStore(
                object_store::Error::AlreadyExists { .. }
                | object_store::Error::Precondition { .. }
                | object_store::Error::NotFound { .. },
            )) => Err(Self::conflict(key)),
            Err(StorageError::ObjectStore(object_store::Error::NotImplemented { .. })) => {
                match &condition {
                    WriteCondition::Matches(expected) => {
                        tracing::debug!(%path, "Conditional update unsupported, comparing tags");
                        self.put_if_current(key, &path, bytes, expected).await
                    }
                    _ => Err(DictionaryError::Backend(format!(
                        "store does not support {condition:?} writes"
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, DictionaryError> {
        let path = self.path(key)?;
        match self.store.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(StorageError::from(e).into()),
        }
        match self.store.delete(&path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, DictionaryError> {
        let objects: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&self.root))
            .try_collect()
            .await
            .map_err(StorageError::from)?;

        let mut keys: Vec<String> = objects
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.strip_suffix(SUFFIX))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self) -> Result<(), DictionaryError> {
        tracing::info!(root = %self.root, "Deleting blob store");
        for key in self.keys().await? {
            let path = self.path(&key)?;
            match self.store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(StorageError::from(e).into()),
            }
        }
        Ok(())
    }
}
