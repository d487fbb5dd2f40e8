//! SurrealDB-backed persistent dictionary.

use queue_core::{
    DictionaryError, DictionaryProvider, ETag, PersistentDictionary, Versioned, WriteCondition,
};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::schema::{define_store, table_name};
use crate::{Database, DbError};

/// Internal record type for SurrealDB.
///
/// Values are stored as JSON text so any document survives unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    key: String,
    value: String,
    etag: String,
}

impl EntryRecord {
    fn new(key: &str, value: &serde_json::Value, etag: &ETag) -> Result<Self, DbError> {
        Ok(Self {
            id: None,
            key: key.to_string(),
            value: serde_json::to_string(value)?,
            etag: etag.to_string(),
        })
    }

    fn into_versioned(self) -> Result<Versioned<serde_json::Value>, DbError> {
        Ok(Versioned {
            value: serde_json::from_str(&self.value)?,
            etag: ETag(self.etag),
        })
    }
}

/// One store, kept in its own table.
#[derive(Clone)]
pub struct SurrealDictionary {
    db: Database,
    table: String,
}

impl SurrealDictionary {
    pub fn table(&self) -> &str {
        &self.table
    }

    fn conflict(key: &str) -> DictionaryError {
        DictionaryError::Conflict {
            key: key.to_string(),
        }
    }

    async fn create(&self, key: &str, record: EntryRecord) -> Result<bool, DbError> {
        let created: Result<Option<EntryRecord>, surrealdb::Error> = self
            .db
            .create((self.table.clone(), key.to_string()))
            .content(record)
            .await;
        match created {
            Ok(record) => Ok(record.is_some()),
            Err(err) if is_record_exists(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn replace_if_matches(
        &self,
        key: &str,
        record: EntryRecord,
        expected: &ETag,
    ) -> Result<bool, DbError> {
        let mut response = self
            .db
            .query(
                r#"
                UPDATE type::thing($tb, $id)
                SET value = $value, etag = $etag, updated_at = time::now()
                WHERE etag = $expected
                RETURN AFTER
                "#,
            )
            .bind(("tb", self.table.clone()))
            .bind(("id", key.to_string()))
            .bind(("value", record.value))
            .bind(("etag", record.etag))
            .bind(("expected", expected.to_string()))
            .await?;
        let updated: Vec<EntryRecord> = response.take(0)?;
        Ok(!updated.is_empty())
    }
}

fn is_record_exists(err: &surrealdb::Error) -> bool {
    if let surrealdb::Error::Db(surrealdb::error::Db::RecordExists { .. }) = err {
        return true;
    }
    // Remote engines report the same condition as an API error.
    err.to_string().contains("already exists")
}

impl PersistentDictionary for SurrealDictionary {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, DictionaryError> {
        let record: Option<EntryRecord> = self
            .db
            .select((self.table.clone(), key.to_string()))
            .await
            .map_err(DbError::from)?;
        Ok(record.map(EntryRecord::into_versioned).transpose()?)
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        condition: WriteCondition,
    ) -> Result<ETag, DictionaryError> {
        let etag = ETag::generate();
        let record = EntryRecord::new(key, &value, &etag)?;

        let written = match condition {
            WriteCondition::Any => {
                let _: Option<EntryRecord> = self
                    .db
                    .upsert((self.table.clone(), key.to_string()))
                    .content(record)
                    .await
                    .map_err(DbError::from)?;
                true
            }
            WriteCondition::Absent => self.create(key, record).await?,
            WriteCondition::Matches(expected) => {
                self.replace_if_matches(key, record, &expected).await?
            }
        };

        if !written {
            tracing::debug!(table = %self.table, key, "Conditional write rejected");
            return Err(Self::conflict(key));
        }
        Ok(etag)
    }

    async fn remove(&self, key: &str) -> Result<bool, DictionaryError> {
        let removed: Option<EntryRecord> = self
            .db
            .delete((self.table.clone(), key.to_string()))
            .await
            .map_err(DbError::from)?;
        Ok(removed.is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, DictionaryError> {
        let mut response = self
            .db
            .query("SELECT VALUE key FROM type::table($tb) ORDER BY key")
            .bind(("tb", self.table.clone()))
            .await
            .map_err(DbError::from)?;
        let keys: Vec<String> = response.take(0).map_err(DbError::from)?;
        Ok(keys)
    }

    async fn delete(&self) -> Result<(), DictionaryError> {
        tracing::info!(table = %self.table, "Deleting dictionary store");
        self.db
            .query("DELETE type::table($tb)")
            .bind(("tb", self.table.clone()))
            .await
            .and_then(|response| response.check())
            .map_err(DbError::from)?;
        Ok(())
    }
}

/// Opens [`SurrealDictionary`] stores on one connection.
#[derive(Clone)]
pub struct SurrealDictionaryProvider {
    db: Database,
}

impl SurrealDictionaryProvider {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl DictionaryProvider for SurrealDictionaryProvider {
    type Dictionary = SurrealDictionary;

    async fn open(&self, name: &str) -> Result<SurrealDictionary, DictionaryError> {
        let table = table_name(name)?;
        define_store(&self.db, &table).await?;
        Ok(SurrealDictionary {
            db: self.db.clone(),
            table,
        })
    }
}
