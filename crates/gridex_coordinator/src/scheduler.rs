//! Job assignment and settlement, plus the periodic reaper.
//!
//! The store serializes concurrent assigners; this layer only adds the
//! registry bookkeeping around the transaction (busy marks are applied
//! after commit, never while the lock-free claim is in flight).

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use gridex_db::{JobResultPayload, JobRow, Store, StoreError};
use gridex_protocol::config::SettlePolicy;
use gridex_protocol::types::JobOutcome;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The result names a job this worker was never assigned; a protocol
    /// violation at the session layer.
    #[error("job {job_id} is not assigned to worker {worker_id}")]
    WrongWorker { job_id: String, worker_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Scheduler {
    store: Store,
    registry: Arc<Registry>,
    policy: SettlePolicy,
}

impl Scheduler {
    pub fn new(store: Store, registry: Arc<Registry>, policy: SettlePolicy) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    /// Try to assign the next matching queue entry to the worker. Returns
    /// `None` when the worker is unknown, already busy, or nothing matches.
    pub async fn assign(&self, worker_id: &str) -> Result<Option<JobRow>, ScheduleError> {
        let Some(entry) = self.registry.get(worker_id) else {
            return Ok(None);
        };
        if entry.assigned_job_id.is_some() {
            warn!("Worker {} requested a job while one is in flight", worker_id);
            return Ok(None);
        }

        let assigned = self
            .store
            .assign_next_job(worker_id, &entry.specs, Utc::now())
            .await?;
        if let Some(job) = &assigned {
            self.registry.begin_assignment(worker_id, &job.id);
        }
        Ok(assigned)
    }

    /// Undo an assignment whose job message never reached the worker: the
    /// job fails with `worker_lost` and the submitter is refunded, so the
    /// outcome is visible rather than silently retried.
    pub async fn rollback_assignment(&self, worker_id: &str, job_id: &str) {
        self.registry.clear_assignment(worker_id);
        match self.store.fail_job_worker_lost(job_id, Utc::now()).await {
            Ok(_) => warn!("Rolled back undeliverable job {} from {}", job_id, worker_id),
            Err(StoreError::NotRunning(_)) => {}
            Err(e) => error!("Failed to roll back job {}: {}", job_id, e),
        }
    }

    /// Settle a result from a worker. `Ok(None)` means the job was no
    /// longer running (a reap won the race) and the delivery was dropped.
    pub async fn settle(
        &self,
        worker_id: &str,
        job_id: &str,
        outcome: JobOutcome,
        result: JobResultPayload,
    ) -> Result<Option<JobRow>, ScheduleError> {
        let job = self.store.job(job_id).await?;
        if job.assigned_worker_id.as_deref() != Some(worker_id) {
            return Err(ScheduleError::WrongWorker {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }

        let settled = match self
            .store
            .settle_job(job_id, outcome, &result, &self.policy, Utc::now())
            .await
        {
            Ok(job) => Some(job),
            Err(StoreError::NotRunning(_)) => {
                warn!("Dropping late result for job {} from {}", job_id, worker_id);
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.registry.clear_assignment(worker_id);
        Ok(settled)
    }

    /// Periodic stall detection: jobs whose worker has been silent past the
    /// grace fail with a refund, and the 2x-timeout safety net catches
    /// workers that heartbeat but never conclude.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, grace: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reap_once(grace).await;
        }
    }

    pub async fn reap_once(&self, grace: Duration) {
        let now = Utc::now();

        // Sweep heartbeat-stale registry entries first: a half-open socket
        // never closes the session, so the gap is the only offline signal.
        // The persisted flip leaves the heartbeat stamp alone so the job
        // reap below fires in the same pass.
        let cutoff =
            now - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::days(365));
        for worker_id in self.registry.stale(cutoff) {
            warn!("Worker {} missed the stall grace, marking offline", worker_id);
            self.registry.mark_offline(&worker_id);
            if let Err(e) = self.store.flag_worker_offline(&worker_id).await {
                error!("Failed to persist offline state of {}: {}", worker_id, e);
            }
        }

        match self.store.reap_stalled_jobs(now, grace).await {
            Ok(reaped) => {
                for job in &reaped {
                    if let Some(worker_id) = job.assigned_worker_id.as_deref() {
                        self.registry.clear_assignment(worker_id);
                    }
                }
                if !reaped.is_empty() {
                    info!("Reaper failed {} stalled job(s)", reaped.len());
                }
            }
            Err(e) => error!("Stall reap failed: {}", e),
        }

        match self.store.reap_overdue_jobs(now).await {
            Ok(reaped) => {
                for job in &reaped {
                    if let Some(worker_id) = job.assigned_worker_id.as_deref() {
                        self.registry.clear_assignment(worker_id);
                    }
                }
                if !reaped.is_empty() {
                    warn!("Reaper failed {} overdue job(s)", reaped.len());
                }
            }
            Err(e) => error!("Overdue reap failed: {}", e),
        }
    }
}
