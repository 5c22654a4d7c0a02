use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Row, SqlitePool};

use crate::error::{CoreResult, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    TensorFlow,
    PyTorch,
    Onnx,
    Keras,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::TensorFlow => "tensorflow",
            Framework::PyTorch => "pytorch",
            Framework::Onnx => "onnx",
            Framework::Keras => "keras",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "tensorflow" => Ok(Framework::TensorFlow),
            "pytorch" => Ok(Framework::PyTorch),
            "onnx" => Ok(Framework::Onnx),
            "keras" => Ok(Framework::Keras),
            _ => Err(Error::Validation {
                message: format!("invalid framework: {}", s),
            }),
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelAsset {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub framework: Framework,
    pub file_path: PathBuf,
    pub created_at: i64,
}

/// Metadata store for uploaded model files. Deleting an asset removes the
/// backing file before the row; a file already gone is tolerated so a
/// half-finished delete can be retried.
pub struct ModelAssetStore {
    pool: SqlitePool,
}

impl ModelAssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn register(
        &self,
        user_id: i64,
        name: &str,
        framework: Framework,
        file_path: &Path,
    ) -> CoreResult<ModelAsset> {
        if name.trim().is_empty() {
            return Err(Error::Validation {
                message: "model name must not be empty".to_string(),
            });
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "INSERT INTO model_assets (user_id, name, framework, file_path, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(framework.as_str())
        .bind(file_path.display().to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!(user_id, model = name, framework = %framework, "Model asset registered");
        self.get(id, user_id).await
    }

    pub async fn get(&self, id: i64, user_id: i64) -> CoreResult<ModelAsset> {
        let row = sqlx::query(
            "SELECT id, user_id, name, framework, file_path, created_at FROM model_assets WHERE id = ? AND user_id = ?",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => asset_from_row(row),
            None => Err(Error::NotFound {
                what: format!("model asset {} for user {}", id, user_id),
            }),
        }
    }

    pub async fn list_for_user(&self, user_id: i64) -> CoreResult<Vec<ModelAsset>> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, framework, file_path, created_at FROM model_assets WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(asset_from_row).collect()
    }

    /// Remove the asset's backing file, then its row.
    pub async fn delete(&self, id: i64, user_id: i64) -> CoreResult<()> {
        let asset = self.get(id, user_id).await?;

        match tokio::fs::remove_file(&asset.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    user_id,
                    "Model file {} already absent",
                    asset.file_path.display()
                );
            }
            Err(source) => {
                return Err(Error::Storage {
                    path: asset.file_path.display().to_string(),
                    source,
                });
            }
        }

        sqlx::query("DELETE FROM model_assets WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(user_id, model = %asset.name, "Model asset deleted");
        Ok(())
    }
}

fn asset_from_row(row: sqlx::sqlite::SqliteRow) -> CoreResult<ModelAsset> {
    let framework_str: String = row.get("framework");
    let file_path: String = row.get("file_path");

    Ok(ModelAsset {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        framework: Framework::parse(&framework_str)?,
        file_path: PathBuf::from(file_path),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::schema::SchemaManager;
    use tempfile::{tempdir, NamedTempFile};

    // The temp file must outlive the pool; dropping it unlinks the database
    // out from under live connections.
    async fn setup_test_db() -> (NamedTempFile, ModelAssetStore) {
        let db_file = NamedTempFile::new().unwrap();
        let db_path = db_file.path().to_str().unwrap();

        let conn_manager = ConnectionManager::new(db_path).await.unwrap();
        SchemaManager::new(conn_manager.pool().clone())
            .initialize_schema()
            .await
            .unwrap();

        let store = ModelAssetStore::new(conn_manager.pool().clone());
        (db_file, store)
    }

    #[tokio::test]
    async fn test_delete_removes_backing_file() {
        let (_db, store) = setup_test_db().await;
        let dir = tempdir().unwrap();
        let model_file = dir.path().join("resnet.onnx");
        std::fs::write(&model_file, b"weights").unwrap();

        let asset = store
            .register(1, "resnet", Framework::Onnx, &model_file)
            .await
            .unwrap();
        assert!(model_file.exists());

        store.delete(asset.id, 1).await.unwrap();
        assert!(!model_file.exists());
        assert!(store.list_for_user(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_file() {
        let (_db, store) = setup_test_db().await;
        let dir = tempdir().unwrap();
        let model_file = dir.path().join("ghost.h5");
        std::fs::write(&model_file, b"weights").unwrap();

        let asset = store
            .register(1, "ghost", Framework::Keras, &model_file)
            .await
            .unwrap();
        std::fs::remove_file(&model_file).unwrap();

        store.delete(asset.id, 1).await.unwrap();
        assert!(store.list_for_user(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_assets_scoped_to_owner() {
        let (_db, store) = setup_test_db().await;
        let dir = tempdir().unwrap();
        let model_file = dir.path().join("mine.pt");
        std::fs::write(&model_file, b"weights").unwrap();

        let asset = store
            .register(1, "mine", Framework::PyTorch, &model_file)
            .await
            .unwrap();

        let result = store.delete(asset.id, 2).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(model_file.exists());
    }
}
