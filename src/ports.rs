use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::{CoreResult, Error};
use crate::records::ContainerKind;

/// Host port allocator backed by a persisted reservation table keyed by
/// `(user_id, kind)`. Allocation and release are globally serialized; the
/// UNIQUE constraint on `host_port` backstops the lock across processes.
pub struct PortAllocator {
    pool: SqlitePool,
    range_start: u16,
    range_end: u16,
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(pool: SqlitePool, range_start: u16, range_end: u16) -> Self {
        Self {
            pool,
            range_start,
            range_end,
            lock: Mutex::new(()),
        }
    }

    /// Reserve a host port for `(user_id, kind)`. Re-allocating an already
    /// reserved pair returns the existing port.
    pub async fn allocate(&self, user_id: i64, kind: ContainerKind) -> CoreResult<u16> {
        let _guard = self.lock.lock().await;

        if let Some(port) = self.reservation_locked(user_id, kind).await? {
            tracing::debug!(user_id, kind = %kind, port, "Reusing existing port reservation");
            return Ok(port);
        }

        let taken: Vec<(i64,)> = sqlx::query_as("SELECT host_port FROM port_reservations")
            .fetch_all(&self.pool)
            .await?;
        let taken: HashSet<i64> = taken.into_iter().map(|(port,)| port).collect();

        let port = (self.range_start..=self.range_end)
            .find(|candidate| !taken.contains(&(*candidate as i64)))
            .ok_or(Error::PortsExhausted {
                start: self.range_start,
                end: self.range_end,
            })?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO port_reservations (user_id, kind, host_port, reserved_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(port as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id, kind = %kind, port, "Allocated host port");
        Ok(port)
    }

    /// Release the reservation for `(user_id, kind)`. Releasing a pair with
    /// no reservation is a no-op so rollback paths can call it blindly.
    pub async fn release(&self, user_id: i64, kind: ContainerKind) -> CoreResult<()> {
        let _guard = self.lock.lock().await;

        let result = sqlx::query("DELETE FROM port_reservations WHERE user_id = ? AND kind = ?")
            .bind(user_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::info!(user_id, kind = %kind, "Released host port reservation");
        }
        Ok(())
    }

    pub async fn reservation(&self, user_id: i64, kind: ContainerKind) -> CoreResult<Option<u16>> {
        let _guard = self.lock.lock().await;
        self.reservation_locked(user_id, kind).await
    }

    async fn reservation_locked(
        &self,
        user_id: i64,
        kind: ContainerKind,
    ) -> CoreResult<Option<u16>> {
        let port: Option<i64> = sqlx::query_scalar(
            "SELECT host_port FROM port_reservations WHERE user_id = ? AND kind = ?",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(port.map(|p| p as u16))
    }
}
