use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};

use crate::config::Config;
use crate::error::CoreResult;

/// Owns the SQLite pool shared by every store in the crate. All stores
/// clone the pool; dropping the manager does not tear down in-flight
/// connections.
pub struct ConnectionManager {
    pool: SqlitePool,
}

impl ConnectionManager {
    /// Open the database at `database_path`, creating it if missing.
    /// WAL with a 30s busy timeout keeps concurrent lifecycle operations
    /// from tripping over each other's writes.
    pub async fn new(database_path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = database_path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("foreign_keys", "ON")
            .disable_statement_logging();

        let pool = SqlitePool::connect_with(options).await?;

        // Fail now, not on the first store call, if the file is unusable
        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        tracing::debug!("Opened database at {}", path.display());

        Ok(Self { pool })
    }

    /// Open the database named by the crate configuration.
    pub async fn from_config(config: &Config) -> CoreResult<Self> {
        Self::new(&config.database_path).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_open_creates_usable_database() {
        let db_file = NamedTempFile::new().unwrap();

        let config = Config {
            database_path: db_file.path().to_str().unwrap().to_string(),
            ..Config::default()
        };
        let manager = ConnectionManager::from_config(&config).await.unwrap();

        sqlx::query("CREATE TABLE scratch (id INTEGER PRIMARY KEY)")
            .execute(manager.pool())
            .await
            .unwrap();
        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(manager.pool())
            .await
            .unwrap();
        assert_eq!(mode.0, "wal");

        manager.close().await;
    }
}
