//! SurrealDB integration for the work item queue.
//!
//! This crate provides database connectivity and a [`PersistentDictionary`]
//! backend that keeps each named store in its own table.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage
//!
//! [`PersistentDictionary`]: queue_core::PersistentDictionary

mod connection;
mod dictionary;
mod schema;

pub use connection::{Database, DbConfig, DbError, connect};
pub use dictionary::{SurrealDictionary, SurrealDictionaryProvider};
pub use schema::{define_store, table_name};

/// Connect with the given configuration and wrap the connection in a provider.
pub async fn open_provider(config: &DbConfig) -> Result<SurrealDictionaryProvider, DbError> {
    let db = connect(config).await?;
    Ok(SurrealDictionaryProvider::new(db))
}
