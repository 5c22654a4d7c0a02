use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{CoreResult, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerKind {
    Regular,
    Jupyter,
    AiServing,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Regular => "regular",
            ContainerKind::Jupyter => "jupyter",
            ContainerKind::AiServing => "ai-serving",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "regular" => Ok(ContainerKind::Regular),
            "jupyter" => Ok(ContainerKind::Jupyter),
            "ai-serving" => Ok(ContainerKind::AiServing),
            _ => Err(Error::Validation {
                message: format!("invalid container kind: {}", s),
            }),
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Pending,
    Building,
    Created,
    Running,
    Stopped,
    Error,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Pending => "pending",
            ContainerStatus::Building => "building",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "pending" => Ok(ContainerStatus::Pending),
            "building" => Ok(ContainerStatus::Building),
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "error" => Ok(ContainerStatus::Error),
            _ => Err(Error::Validation {
                message: format!("invalid container status: {}", s),
            }),
        }
    }

    /// In-flight statuses block a new create for the same (user, kind).
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Pending
                | ContainerStatus::Building
                | ContainerStatus::Created
                | ContainerStatus::Running
        )
    }

    pub fn can_transition_to(&self, new_status: ContainerStatus) -> bool {
        if *self == new_status {
            // Idempotent operations re-assert the current status
            return true;
        }
        match (self, new_status) {
            (ContainerStatus::Pending, ContainerStatus::Building) => true,
            (ContainerStatus::Pending, ContainerStatus::Created) => true,
            (ContainerStatus::Building, ContainerStatus::Created) => true,
            (ContainerStatus::Created, ContainerStatus::Running) => true,
            (ContainerStatus::Created, ContainerStatus::Stopped) => true,
            (ContainerStatus::Running, ContainerStatus::Stopped) => true,
            (ContainerStatus::Stopped, ContainerStatus::Running) => true,
            (_, ContainerStatus::Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mapped port, container side to host side. TCP only; the original
/// system never mapped anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// Durable association between one user and one container of a given kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    pub user_id: i64,
    pub kind: ContainerKind,
    pub runtime_id: Option<String>,
    pub image_reference: String,
    pub status: ContainerStatus,
    pub port_bindings: Vec<PortBinding>,
    pub drift_detected: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordCensus {
    pub total: i64,
    pub running: i64,
}

pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic upsert keyed by (user_id, kind). A second create for the same
    /// pair updates the existing row in place; duplicates cannot exist.
    /// The drift flag is cleared since the row now reflects fresh reality.
    pub async fn upsert(
        &self,
        user_id: i64,
        kind: ContainerKind,
        runtime_id: Option<&str>,
        image_reference: &str,
        status: ContainerStatus,
        port_bindings: &[PortBinding],
    ) -> CoreResult<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let bindings_json = serde_json::to_string(port_bindings)?;

        sqlx::query(
            r#"
            INSERT INTO container_records (
                user_id, kind, runtime_id, image_reference, status,
                port_bindings, drift_detected, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(user_id, kind) DO UPDATE SET
                runtime_id = excluded.runtime_id,
                image_reference = excluded.image_reference,
                status = excluded.status,
                port_bindings = excluded.port_bindings,
                drift_detected = 0,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(runtime_id)
        .bind(image_reference)
        .bind(status.as_str())
        .bind(&bindings_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(user_id, kind = %kind, status = %status, "Upserted container record");
        Ok(())
    }

    pub async fn get(&self, user_id: i64, kind: ContainerKind) -> CoreResult<ContainerRecord> {
        self.find(user_id, kind).await?.ok_or_else(|| Error::NotFound {
            what: format!("container record for user {} ({})", user_id, kind),
        })
    }

    pub async fn find(
        &self,
        user_id: i64,
        kind: ContainerKind,
    ) -> CoreResult<Option<ContainerRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, kind, runtime_id, image_reference, status,
                   port_bindings, drift_detected, created_at, updated_at
            FROM container_records WHERE user_id = ? AND kind = ?
        "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    /// Optimistic status update: read the current status, validate the
    /// transition, then write only if the row still holds what was read.
    /// One retry on conflict, then `Busy`.
    pub async fn set_status(
        &self,
        user_id: i64,
        kind: ContainerKind,
        new_status: ContainerStatus,
    ) -> CoreResult<()> {
        for _attempt in 0..2 {
            let current = self.get(user_id, kind).await?.status;
            if current == new_status {
                return Ok(());
            }
            if !current.can_transition_to(new_status) {
                return Err(Error::InvalidTransition {
                    from: current,
                    to: new_status,
                });
            }

            let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            let result = sqlx::query(
                "UPDATE container_records SET status = ?, updated_at = ? WHERE user_id = ? AND kind = ? AND status = ?",
            )
            .bind(new_status.as_str())
            .bind(now)
            .bind(user_id)
            .bind(kind.as_str())
            .bind(current.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::debug!(user_id, kind = %kind, from = %current, to = %new_status, "Container status updated");
                return Ok(());
            }
        }

        Err(Error::Busy)
    }

    /// Record that the engine no longer knows the stored runtime id. The
    /// record stays around (status error, drift flag set) so the caller can
    /// offer recreation.
    pub async fn mark_drift(&self, user_id: i64, kind: ContainerKind) -> CoreResult<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE container_records SET status = 'error', drift_detected = 1, updated_at = ? WHERE user_id = ? AND kind = ?",
        )
        .bind(now)
        .bind(user_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                what: format!("container record for user {} ({})", user_id, kind),
            });
        }

        tracing::warn!(user_id, kind = %kind, "Marked container record as drifted");
        Ok(())
    }

    pub async fn delete(&self, user_id: i64, kind: ContainerKind) -> CoreResult<()> {
        let result = sqlx::query("DELETE FROM container_records WHERE user_id = ? AND kind = ?")
            .bind(user_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                what: format!("container record for user {} ({})", user_id, kind),
            });
        }

        tracing::info!(user_id, kind = %kind, "Deleted container record");
        Ok(())
    }

    pub async fn count_for_user(&self, user_id: i64) -> CoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM container_records WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn list(
        &self,
        status_filter: Option<ContainerStatus>,
    ) -> CoreResult<Vec<ContainerRecord>> {
        let rows = match status_filter {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT user_id, kind, runtime_id, image_reference, status,
                           port_bindings, drift_detected, created_at, updated_at
                    FROM container_records WHERE status = ? ORDER BY created_at DESC
                "#,
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT user_id, kind, runtime_id, image_reference, status,
                           port_bindings, drift_detected, created_at, updated_at
                    FROM container_records ORDER BY created_at DESC
                "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(record_from_row).collect()
    }

    pub async fn census(&self) -> CoreResult<RecordCensus> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM container_records")
            .fetch_one(&self.pool)
            .await?;
        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM container_records WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;

        Ok(RecordCensus { total, running })
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> CoreResult<ContainerRecord> {
    let kind_str: String = row.get("kind");
    let status_str: String = row.get("status");
    let bindings_json: String = row.get("port_bindings");

    Ok(ContainerRecord {
        user_id: row.get("user_id"),
        kind: ContainerKind::parse(&kind_str)?,
        runtime_id: row.get("runtime_id"),
        image_reference: row.get("image_reference"),
        status: ContainerStatus::parse(&status_str)?,
        port_bindings: serde_json::from_str(&bindings_json)?,
        drift_detected: row.get("drift_detected"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
