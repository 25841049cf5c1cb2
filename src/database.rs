//! Embedded SQLite storage bootstrap.
//!
//! Owns pool construction, pragma application, and the embedded migration
//! run. Every store in [`crate::storage`] borrows the pool from here.

use sqlx::{Pool, Sqlite, migrate::Migrator};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Static migrator for embedded migrations under `migrations/`.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database-layer errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Connection settings for the embedded database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: PathBuf,
    max_connections: u32,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Config with production defaults (WAL mode, pooled connections).
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: 10,
            enable_wal_mode: true,
        }
    }

    /// Minimal settings for tests: one connection, no WAL.
    pub fn for_testing<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_connections: 1,
            enable_wal_mode: false,
        }
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Database connection with a managed pool and applied schema.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    fn connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .foreign_keys(true);

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        options.disable_statement_logging()
    }

    /// Opens the pool, applies pragmas, and runs embedded migrations.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(Self::connect_options(&config))
            .await?;

        // NORMAL keeps writes crash-safe in WAL mode without FULL's fsync
        // per transaction.
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&pool)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!(path = %config.path.display(), "database initialized");

        Ok(Self { pool })
    }

    /// Opens an in-memory database with the full schema. Test-friendly.
    ///
    /// Pinned to a single pooled connection: every connection to
    /// `sqlite::memory:` is a distinct database, so the pool must never
    /// open a second one.
    pub async fn initialize_in_memory() -> DatabaseResult<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn initialize_creates_schema_and_tracking_table() {
        let dir = tempdir().unwrap();
        let config = DatabaseConfig::for_testing(dir.path().join("control.db"));
        let db = DatabaseConnection::initialize(config).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        for expected in [
            "agents",
            "sessions",
            "agent_commands",
            "repositories",
            "catalog_templates",
            "templates",
            "user_template_favorites",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
        assert!(tables.iter().any(|t| t == "_sqlx_migrations"));
    }

    #[tokio::test]
    async fn in_memory_database_carries_the_same_schema() {
        let db = DatabaseConnection::initialize_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn initialize_creates_missing_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state").join("control.db");
        let db = DatabaseConnection::initialize(DatabaseConfig::for_testing(&nested))
            .await
            .unwrap();
        drop(db);
        assert!(nested.exists());
    }
}
