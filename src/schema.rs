use sqlx::SqlitePool;

use crate::error::CoreResult;

pub struct SchemaManager {
    pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> CoreResult<()> {
        self.create_container_records_table().await?;
        self.create_port_reservations_table().await?;
        self.create_image_catalog_table().await?;
        self.create_model_assets_table().await?;
        self.create_indexes().await?;

        tracing::info!("Database schema initialized");
        Ok(())
    }

    async fn create_container_records_table(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS container_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT CHECK(kind IN ('regular', 'jupyter', 'ai-serving')) NOT NULL,
                runtime_id TEXT,
                image_reference TEXT NOT NULL,
                status TEXT CHECK(status IN ('pending', 'building', 'created', 'running', 'stopped', 'error')) NOT NULL,
                port_bindings TEXT NOT NULL DEFAULT '[]', -- JSON array
                drift_detected INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,

                UNIQUE(user_id, kind)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_port_reservations_table(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS port_reservations (
                user_id INTEGER NOT NULL,
                kind TEXT CHECK(kind IN ('regular', 'jupyter', 'ai-serving')) NOT NULL,
                host_port INTEGER NOT NULL UNIQUE,
                reserved_at INTEGER NOT NULL,

                PRIMARY KEY (user_id, kind)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_image_catalog_table(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS image_catalog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                tag TEXT NOT NULL DEFAULT 'latest',
                source TEXT CHECK(source IN ('hub', 'dockerfile')) NOT NULL,
                dockerfile TEXT,
                public INTEGER NOT NULL DEFAULT 0,
                created_by INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_model_assets_table(&self) -> CoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                framework TEXT CHECK(framework IN ('tensorflow', 'pytorch', 'onnx', 'keras')) NOT NULL,
                file_path TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_indexes(&self) -> CoreResult<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_container_records_status ON container_records(status)",
            "CREATE INDEX IF NOT EXISTS idx_container_records_user ON container_records(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_image_catalog_owner ON image_catalog(created_by)",
            "CREATE INDEX IF NOT EXISTS idx_image_catalog_public ON image_catalog(public)",
            "CREATE INDEX IF NOT EXISTS idx_model_assets_user ON model_assets(user_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_schema_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let conn_manager = ConnectionManager::new(db_path).await.unwrap();
        let schema_manager = SchemaManager::new(conn_manager.pool().clone());

        schema_manager.initialize_schema().await.unwrap();
        // Second run must be a no-op
        schema_manager.initialize_schema().await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(conn_manager.pool())
                .await
                .unwrap();

        let table_names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();

        assert!(table_names.contains(&"container_records".to_string()));
        assert!(table_names.contains(&"port_reservations".to_string()));
        assert!(table_names.contains(&"image_catalog".to_string()));
        assert!(table_names.contains(&"model_assets".to_string()));

        conn_manager.close().await;
    }
}
