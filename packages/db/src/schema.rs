//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Map a store name onto a table name.
///
/// Store names may contain ASCII letters, digits, `-` and `_`; dashes become
/// underscores and every table is prefixed so it cannot collide with a
/// SurrealQL keyword.
pub fn table_name(store: &str) -> Result<String, DbError> {
    let store = store.trim();
    if store.is_empty() {
        return Err(DbError::InvalidName("store name must not be empty".into()));
    }
    if let Some(bad) = store
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(DbError::InvalidName(format!(
            "unsupported character {bad:?} in store name {store}"
        )));
    }
    Ok(format!("store_{}", store.to_ascii_lowercase().replace('-', "_")))
}

/// Define the table backing one dictionary store.
///
/// Safe to call repeatedly; every statement is `IF NOT EXISTS`.
pub async fn define_store(db: &Database, table: &str) -> Result<(), DbError> {
    tracing::debug!(table, "Defining dictionary table");
    db.query(store_schema(table)).await?.check()?;
    Ok(())
}

fn store_schema(table: &str) -> String {
    format!(
        r#"
DEFINE TABLE IF NOT EXISTS {table} SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS key ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS value ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS etag ON {table} TYPE string;
DEFINE FIELD IF NOT EXISTS updated_at ON {table} TYPE datetime DEFAULT time::now();

DEFINE INDEX IF NOT EXISTS {table}_key ON {table} FIELDS key UNIQUE;
"#
    )
}
