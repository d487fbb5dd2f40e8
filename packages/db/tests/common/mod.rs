use db::{DbConfig, DbError, SurrealDictionaryProvider};

/// Fresh in-memory database per test; each `mem://` connection is isolated.
pub async fn setup_provider() -> Result<SurrealDictionaryProvider, DbError> {
    db::open_provider(&DbConfig::memory().with_database("test")).await
}
