//! Database connection management.

use queue_core::DictionaryError;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect as connect_any};
use surrealdb::opt::auth::Root;
use thiserror::Error;

/// Database connection handle. Cloning shares the underlying connection.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection mode: "mem://", "file://path" or a remote endpoint
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "workqueue".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for file-based persistence.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("file://{}", path.into()),
            ..Default::default()
        }
    }

    /// Create a config for RocksDB persistence (requires rocksdb feature).
    pub fn rocksdb(path: impl Into<String>) -> Self {
        Self {
            endpoint: format!("rocksdb://{}", path.into()),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `SURREAL_ENDPOINT` (default: `mem://`)
    /// - `SURREAL_NAMESPACE` (default: `workqueue`)
    /// - `SURREAL_DATABASE` (default: `main`)
    /// - `SURREAL_USER` and `SURREAL_PASS` (optional; both required to sign in)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let credentials = match (env_non_empty("SURREAL_USER"), env_non_empty("SURREAL_PASS")) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Self {
            endpoint: env_non_empty("SURREAL_ENDPOINT").unwrap_or(defaults.endpoint),
            namespace: env_non_empty("SURREAL_NAMESPACE").unwrap_or(defaults.namespace),
            database: env_non_empty("SURREAL_DATABASE").unwrap_or(defaults.database),
            credentials,
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Invalid store name: {0}")]
    InvalidName(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DbError> for DictionaryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidName(name) => DictionaryError::InvalidKey(name),
            DbError::Serialization(e) => DictionaryError::Serialization(e),
            other => DictionaryError::Backend(other.to_string()),
        }
    }
}

/// Open a database connection.
///
/// The returned handle is passed to whatever needs it; nothing is stored
/// globally, so tests can run against independent in-memory instances.
pub async fn connect(config: &DbConfig) -> Result<Database, DbError> {
    tracing::info!("Connecting to database: {}", config.endpoint);

    let db = connect_any(config.endpoint.as_str()).await?;

    // Authenticate if credentials provided
    if let Some((username, password)) = &config.credentials {
        db.signin(Root {
            username,
            password,
        })
        .await?;
    }

    db.use_ns(&config.namespace).use_db(&config.database).await?;

    tracing::info!(
        "Connected to database: {}/{}",
        config.namespace,
        config.database
    );

    Ok(db)
}
