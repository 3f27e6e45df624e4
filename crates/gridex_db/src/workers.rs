//! Worker rows.
//!
//! A worker row is the durable identity of a compute node; the per-session
//! handle lives in the coordinator's registry. Identity is the (owner, name)
//! pair so a reconnecting worker re-adopts its row instead of minting a new
//! one.

use chrono::{DateTime, Utc};
use gridex_protocol::types::{WorkerSpecs, WorkerStatus};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{WorkerRow, WorkerState};
use crate::{Result, Store};

impl Store {
    /// Register a worker, idempotent on (owner, name). An existing row is
    /// re-adopted with fresh specs; otherwise a new id is allocated.
    pub async fn register_worker(
        &self,
        owner_id: Option<&str>,
        name: &str,
        specs: &WorkerSpecs,
        now: DateTime<Utc>,
    ) -> Result<WorkerRow> {
        let specs_json = serde_json::to_string(specs)?;
        let mut tx = self.pool().begin().await?;

        // "IS ?" is null-safe in SQLite, so anonymous workers re-adopt too.
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM gx_workers WHERE owner_id IS ? AND name = ?")
                .bind(owner_id)
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE gx_workers
                    SET specs_json = ?, status = ?, last_heartbeat = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&specs_json)
                .bind(WorkerState::Idle)
                .bind(now)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                info!("Worker '{}' re-adopted identity {}", name, id);
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    r#"
                    INSERT INTO gx_workers
                        (id, name, owner_id, specs_json, status, last_heartbeat, created_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(name)
                .bind(owner_id)
                .bind(&specs_json)
                .bind(WorkerState::Idle)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                info!("Worker '{}' registered as {}", name, id);
                id
            }
        };

        let row: WorkerRow = sqlx::query_as("SELECT * FROM gx_workers WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn worker(&self, worker_id: &str) -> Result<WorkerRow> {
        sqlx::query_as("SELECT * FROM gx_workers WHERE id = ?")
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))
    }

    /// Record a heartbeat and the reported status.
    pub async fn worker_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE gx_workers SET status = ?, last_heartbeat = ? WHERE id = ?",
        )
        .bind(WorkerState::from(status))
        .bind(now)
        .bind(worker_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::WorkerNotFound(worker_id.to_string()));
        }
        Ok(())
    }

    /// Mark a worker offline, stamping the detach time so the stall grace
    /// counts from now.
    pub async fn mark_worker_offline(&self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE gx_workers SET status = ?, last_heartbeat = ? WHERE id = ?")
            .bind(WorkerState::Offline)
            .bind(now)
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Mark a heartbeat-stale worker offline without touching the
    /// heartbeat stamp, so the stall grace keeps counting from the last
    /// real heartbeat and its running job is reapable immediately.
    pub async fn flag_worker_offline(&self, worker_id: &str) -> Result<()> {
        sqlx::query("UPDATE gx_workers SET status = ? WHERE id = ?")
            .bind(WorkerState::Offline)
            .bind(worker_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Credit lifetime counters after a completed job.
    pub(crate) async fn bump_worker_counters(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        worker_id: &str,
        credits: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gx_workers
            SET jobs_completed = jobs_completed + 1,
                credits_earned = credits_earned + ?
            WHERE id = ?
            "#,
        )
        .bind(credits)
        .bind(worker_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM gx_workers ORDER BY created_at ASC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn workers_for_owner(&self, owner_id: &str) -> Result<Vec<WorkerRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM gx_workers WHERE owner_id = ? ORDER BY created_at ASC")
                .bind(owner_id)
                .fetch_all(self.pool())
                .await?,
        )
    }
}
