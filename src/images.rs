use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Row, SqlitePool};

use crate::error::{CoreResult, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Pulled from a registry by name:tag.
    Hub,
    /// Built from a stored Dockerfile.
    Dockerfile,
}

impl ImageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageOrigin::Hub => "hub",
            ImageOrigin::Dockerfile => "dockerfile",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "hub" => Ok(ImageOrigin::Hub),
            "dockerfile" => Ok(ImageOrigin::Dockerfile),
            _ => Err(Error::Validation {
                message: format!("invalid image origin: {}", s),
            }),
        }
    }
}

impl fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub id: i64,
    pub name: String,
    pub tag: String,
    pub origin: ImageOrigin,
    pub dockerfile: Option<String>,
    pub public: bool,
    pub created_by: i64,
    pub created_at: i64,
}

impl ImageEntry {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub name: String,
    /// Defaults to "latest".
    pub tag: Option<String>,
    pub origin: ImageOrigin,
    pub dockerfile: Option<String>,
    pub public: bool,
}

/// Catalog of images users can request containers from: registry
/// references plus user-submitted Dockerfiles.
pub struct ImageCatalog {
    pool: SqlitePool,
}

impl ImageCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, owner_id: i64, image: NewImage) -> CoreResult<ImageEntry> {
        if image.name.trim().is_empty() {
            return Err(Error::Validation {
                message: "image name must not be empty".to_string(),
            });
        }
        if image.origin == ImageOrigin::Dockerfile
            && image.dockerfile.as_deref().map_or(true, |d| d.trim().is_empty())
        {
            return Err(Error::Validation {
                message: "dockerfile-sourced image requires dockerfile contents".to_string(),
            });
        }

        let tag = image.tag.unwrap_or_else(|| "latest".to_string());
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO image_catalog (name, tag, source, dockerfile, public, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&image.name)
        .bind(&tag)
        .bind(image.origin.as_str())
        .bind(&image.dockerfile)
        .bind(image.public)
        .bind(owner_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        tracing::info!(owner_id, image = %image.name, tag = %tag, "Image registered in catalog");
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> CoreResult<ImageEntry> {
        let row = sqlx::query(
            "SELECT id, name, tag, source, dockerfile, public, created_by, created_at FROM image_catalog WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => entry_from_row(row),
            None => Err(Error::NotFound {
                what: format!("image catalog entry {}", id),
            }),
        }
    }

    /// Images a user can request: their own plus public ones.
    pub async fn visible_to(&self, user_id: i64) -> CoreResult<Vec<ImageEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, tag, source, dockerfile, public, created_by, created_at
            FROM image_catalog
            WHERE created_by = ? OR public = 1
            ORDER BY created_at DESC
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Delete an entry; only the owner may remove their image.
    pub async fn delete(&self, id: i64, owner_id: i64) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM image_catalog WHERE id = ? AND created_by = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                what: format!("image catalog entry {} owned by user {}", id, owner_id),
            });
        }

        Ok(())
    }
}

fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> CoreResult<ImageEntry> {
    let origin_str: String = row.get("source");

    Ok(ImageEntry {
        id: row.get("id"),
        name: row.get("name"),
        tag: row.get("tag"),
        origin: ImageOrigin::parse(&origin_str)?,
        dockerfile: row.get("dockerfile"),
        public: row.get("public"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    })
}
