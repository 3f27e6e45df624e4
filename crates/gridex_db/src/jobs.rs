//! Jobs, the pending queue, and credit-accounted settlement.
//!
//! The queue is materialized in `gx_job_queue` so a coordinator restart
//! neither loses nor duplicates work. Assignment and every settlement path
//! are single transactions; two workers racing for the queue head are
//! serialized on the guarded claim UPDATE and at most one wins each row.

use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gridex_protocol::config::SettlePolicy;
use gridex_protocol::types::{failure_reason, ArtifactFile, JobDemands, JobOutcome, WorkerSpecs};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{JobRow, JobState, LedgerKind, QueueStats, StoredArtifact, WorkerState};
use crate::users::apply_ledger;
use crate::{Result, Store};

/// A job as submitted through the API, before it has an id or a status.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub submitter_id: String,
    pub code: String,
    pub requirements: String,
    pub demands: JobDemands,
    pub priority: i64,
}

/// Execution output carried into settlement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResultPayload {
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<ArtifactFile>,
    pub error_log: Option<String>,
    pub sandboxed: bool,
}

impl Store {
    /// Insert the job row, its queue entry, and the submitter's debit in
    /// one transaction. Fails atomically when the balance cannot cover the
    /// cost.
    pub async fn enqueue_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<JobRow> {
        let cost = new.demands.credit_cost();
        let reward = cost;
        let demands_json = serde_json::to_string(&new.demands)?;
        let id = Uuid::new_v4().to_string();

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO gx_jobs
                (id, title, submitter_id, code, requirements, demands_json,
                 timeout_seconds, credit_cost, credit_reward, priority, status, submitted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.title)
        .bind(&new.submitter_id)
        .bind(&new.code)
        .bind(&new.requirements)
        .bind(&demands_json)
        .bind(new.demands.timeout_seconds as i64)
        .bind(cost)
        .bind(reward)
        .bind(new.priority)
        .bind(JobState::Pending)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO gx_job_queue (job_id, priority, queued_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(new.priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        apply_ledger(
            &mut tx,
            &new.submitter_id,
            -cost,
            LedgerKind::JobDebit,
            Some(&id),
            now,
        )
        .await?;

        let job = fetch_job(&mut tx, &id).await?;
        tx.commit().await?;

        info!("Enqueued job {} ('{}', cost {})", id, new.title, cost);
        Ok(job)
    }

    /// Walk the queue in (priority DESC, queued_at ASC, id ASC) order and
    /// claim the first entry whose demands the worker satisfies. The claim
    /// is a guarded UPDATE, so concurrent assigners see each row at most
    /// once; a loser moves on to the next matching entry.
    pub async fn assign_next_job(
        &self,
        worker_id: &str,
        specs: &WorkerSpecs,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>> {
        let mut tx = self.pool().begin().await?;

        let candidates: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT j.* FROM gx_job_queue q
            JOIN gx_jobs j ON j.id = q.job_id
            WHERE j.status = 'pending'
            ORDER BY q.priority DESC, q.queued_at ASC, q.job_id ASC
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        for job in candidates {
            let demands = job.demands()?;
            if !demands.matches(specs) {
                continue;
            }

            let claimed = sqlx::query(
                r#"
                UPDATE gx_jobs
                SET status = ?, assigned_worker_id = ?, started_at = ?
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(JobState::Running)
            .bind(worker_id)
            .bind(now)
            .bind(&job.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed == 0 {
                // Another assigner won this row between the scan and the
                // claim; keep walking.
                continue;
            }

            sqlx::query("DELETE FROM gx_job_queue WHERE job_id = ?")
                .bind(&job.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE gx_workers SET status = ? WHERE id = ?")
                .bind(WorkerState::Busy)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;

            let job = fetch_job(&mut tx, &job.id).await?;
            tx.commit().await?;
            info!("Assigned job {} to worker {}", job.id, worker_id);
            return Ok(Some(job));
        }

        tx.commit().await?;
        Ok(None)
    }

    /// Transition `running -> terminal`, persist the result, and move
    /// credits per the outcome: completion pays the worker's owner, timeout
    /// refunds the submitter per policy, failure refunds only when the
    /// policy says so. Settling a non-running job is rejected, which is what
    /// kills late deliveries after a reap.
    pub async fn settle_job(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        result: &JobResultPayload,
        policy: &SettlePolicy,
        now: DateTime<Utc>,
    ) -> Result<JobRow> {
        let mut tx = self.pool().begin().await?;

        let job = fetch_job(&mut tx, job_id).await?;
        if job.status != JobState::Running {
            return Err(StoreError::NotRunning(job_id.to_string()));
        }

        let manifest = self.persist_artifacts(job_id, &result.files)?;
        let files_json = serde_json::to_string(&manifest)?;
        let updated = sqlx::query(
            r#"
            UPDATE gx_jobs
            SET status = ?, stdout = ?, stderr = ?, result_files = ?,
                error_log = ?, sandboxed = ?, finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(JobState::from(outcome.terminal_status()))
        .bind(&result.stdout)
        .bind(&result.stderr)
        .bind(&files_json)
        .bind(&result.error_log)
        .bind(result.sandboxed)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotRunning(job_id.to_string()));
        }

        match outcome {
            JobOutcome::Completed => {
                if let Some(worker_id) = job.assigned_worker_id.as_deref() {
                    let owner: Option<String> =
                        sqlx::query_scalar("SELECT owner_id FROM gx_workers WHERE id = ?")
                            .bind(worker_id)
                            .fetch_one(&mut *tx)
                            .await?;
                    let earned = if let Some(owner) = owner.as_deref() {
                        apply_ledger(
                            &mut tx,
                            owner,
                            job.credit_reward,
                            LedgerKind::JobCredit,
                            Some(job_id),
                            now,
                        )
                        .await?;
                        job.credit_reward
                    } else {
                        // Anonymous contribution earns nothing.
                        0
                    };
                    Store::bump_worker_counters(&mut tx, worker_id, earned).await?;
                }
            }
            JobOutcome::TimedOut => {
                let refund = policy.timeout_refund(job.credit_cost);
                if refund > 0 {
                    apply_ledger(
                        &mut tx,
                        &job.submitter_id,
                        refund,
                        LedgerKind::JobCredit,
                        Some(job_id),
                        now,
                    )
                    .await?;
                }
            }
            JobOutcome::Failed => {
                if policy.refund_on_failure {
                    apply_ledger(
                        &mut tx,
                        &job.submitter_id,
                        job.credit_cost,
                        LedgerKind::JobCredit,
                        Some(job_id),
                        now,
                    )
                    .await?;
                }
            }
        }

        if let Some(worker_id) = job.assigned_worker_id.as_deref() {
            release_worker(&mut tx, worker_id).await?;
        }

        let job = fetch_job(&mut tx, job_id).await?;
        tx.commit().await?;

        info!("Job {} settled as {}", job_id, outcome);
        Ok(job)
    }

    /// Fail a running job because its worker vanished, with a full refund.
    /// Used by the reaper and by assignment rollback; bypasses the failure
    /// refund policy because the submitter got no execution attempt.
    pub async fn fail_job_worker_lost(&self, job_id: &str, now: DateTime<Utc>) -> Result<JobRow> {
        let mut tx = self.pool().begin().await?;

        let job = fetch_job(&mut tx, job_id).await?;
        if job.status != JobState::Running {
            return Err(StoreError::NotRunning(job_id.to_string()));
        }

        let updated = sqlx::query(
            r#"
            UPDATE gx_jobs
            SET status = ?, error_log = ?, finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(JobState::Failed)
        .bind(failure_reason::WORKER_LOST)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotRunning(job_id.to_string()));
        }

        apply_ledger(
            &mut tx,
            &job.submitter_id,
            job.credit_cost,
            LedgerKind::JobCredit,
            Some(job_id),
            now,
        )
        .await?;

        if let Some(worker_id) = job.assigned_worker_id.as_deref() {
            release_worker(&mut tx, worker_id).await?;
        }

        let job = fetch_job(&mut tx, job_id).await?;
        tx.commit().await?;

        warn!("Job {} failed: worker lost, submitter refunded", job_id);
        Ok(job)
    }

    /// Cancel a pending job owned by the submitter; removes the queue entry
    /// and refunds the full cost.
    pub async fn cancel_pending(
        &self,
        job_id: &str,
        submitter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<JobRow> {
        let mut tx = self.pool().begin().await?;

        let job = fetch_job(&mut tx, job_id).await?;
        if job.submitter_id != submitter_id {
            return Err(StoreError::NotOwner {
                user_id: submitter_id.to_string(),
                job_id: job_id.to_string(),
            });
        }
        let updated = sqlx::query(
            "UPDATE gx_jobs SET status = ?, finished_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(JobState::Cancelled)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotPending(job_id.to_string()));
        }

        sqlx::query("DELETE FROM gx_job_queue WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        apply_ledger(
            &mut tx,
            submitter_id,
            job.credit_cost,
            LedgerKind::JobCredit,
            Some(job_id),
            now,
        )
        .await?;

        let job = fetch_job(&mut tx, job_id).await?;
        tx.commit().await?;

        info!("Job {} cancelled by submitter", job_id);
        Ok(job)
    }

    /// Running jobs whose assigned worker has been silent past the grace
    /// become `failed(worker_lost)` with a refund. Returns the reaped jobs.
    pub async fn reap_stalled_jobs(
        &self,
        now: DateTime<Utc>,
        grace: std::time::Duration,
    ) -> Result<Vec<JobRow>> {
        let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::days(365));
        let cutoff = now - grace;

        let stalled: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT j.id FROM gx_jobs j
            JOIN gx_workers w ON w.id = j.assigned_worker_id
            WHERE j.status = 'running'
              AND (w.last_heartbeat IS NULL OR w.last_heartbeat < ?)
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut reaped = Vec::new();
        for job_id in stalled {
            match self.fail_job_worker_lost(&job_id, now).await {
                Ok(job) => reaped.push(job),
                // A late result won the race; the job settled first.
                Err(StoreError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    /// Safety net behind the worker-side timeout: a running job past
    /// `started_at + 2 * timeout` is treated as lost even if its worker
    /// still heartbeats.
    pub async fn reap_overdue_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRow>> {
        let running: Vec<JobRow> = sqlx::query_as("SELECT * FROM gx_jobs WHERE status = 'running'")
            .fetch_all(self.pool())
            .await?;

        let mut reaped = Vec::new();
        for job in running {
            let Some(started_at) = job.started_at else {
                continue;
            };
            let deadline = started_at + ChronoDuration::seconds(2 * job.timeout_seconds);
            if now <= deadline {
                continue;
            }
            match self.fail_job_worker_lost(&job.id, now).await {
                Ok(job) => reaped.push(job),
                Err(StoreError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    pub async fn job(&self, job_id: &str) -> Result<JobRow> {
        sqlx::query_as("SELECT * FROM gx_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
    }

    pub async fn jobs_for_user(&self, user_id: &str) -> Result<Vec<JobRow>> {
        Ok(sqlx::query_as(
            "SELECT * FROM gx_jobs WHERE submitter_id = ? ORDER BY submitted_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Pending queue in scheduling order, for inspection.
    pub async fn pending_queue(&self) -> Result<Vec<JobRow>> {
        Ok(sqlx::query_as(
            r#"
            SELECT j.* FROM gx_job_queue q
            JOIN gx_jobs j ON j.id = q.job_id
            ORDER BY q.priority DESC, q.queued_at ASC, q.job_id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Write artifact bytes to `<artifact_root>/<job_id>/<name>` and return
    /// the manifest that goes into the job row. Names that escape the job
    /// directory are dropped.
    fn persist_artifacts(
        &self,
        job_id: &str,
        files: &[ArtifactFile],
    ) -> Result<Vec<StoredArtifact>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.artifact_dir(job_id);
        std::fs::create_dir_all(&dir)?;

        let mut manifest = Vec::with_capacity(files.len());
        for file in files {
            let Some(rel) = artifact_rel_path(&file.name) else {
                warn!("Dropping artifact with unsafe name '{}'", file.name);
                continue;
            };
            let bytes = match file.decode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping undecodable artifact '{}': {}", file.name, e);
                    continue;
                }
            };
            let path = dir.join(&rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &bytes)?;
            manifest.push(StoredArtifact {
                name: file.name.clone(),
                size: bytes.len() as u64,
                path: path.to_string_lossy().into_owned(),
            });
        }
        Ok(manifest)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
                COUNT(*) FILTER (WHERE status = 'timed_out') AS timed_out
            FROM gx_jobs
            "#,
        )
        .fetch_one(self.pool())
        .await?)
    }
}

/// Normalize an artifact name to a safe path relative to the job's
/// artifact directory. Parent/root components reject the whole name.
fn artifact_rel_path(name: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            _ => return None,
        }
    }
    if rel.as_os_str().is_empty() {
        None
    } else {
        Some(rel)
    }
}

async fn fetch_job(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, job_id: &str) -> Result<JobRow> {
    sqlx::query_as("SELECT * FROM gx_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))
}

/// Busy -> idle, without disturbing an offline mark.
async fn release_worker(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    worker_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE gx_workers SET status = ? WHERE id = ? AND status = ?")
        .bind(WorkerState::Idle)
        .bind(worker_id)
        .bind(WorkerState::Busy)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
