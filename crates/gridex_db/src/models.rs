//! Database models.
//!
//! Rows map 1:1 onto tables via `FromRow`; status columns use db-side enums
//! so queries stay typo-proof. Conversions to and from the protocol enums
//! live here.

use chrono::{DateTime, Utc};
use gridex_protocol::types::{JobDemands, JobStatus, Role, WorkerSpecs, WorkerStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Running => JobState::Running,
            JobStatus::Completed => JobState::Completed,
            JobStatus::Failed => JobState::Failed,
            JobStatus::Cancelled => JobState::Cancelled,
            JobStatus::TimedOut => JobState::TimedOut,
        }
    }
}

impl From<JobState> for JobStatus {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
            JobState::TimedOut => JobStatus::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Offline,
}

impl From<WorkerStatus> for WorkerState {
    fn from(status: WorkerStatus) -> Self {
        match status {
            WorkerStatus::Idle => WorkerState::Idle,
            WorkerStatus::Busy => WorkerState::Busy,
            WorkerStatus::Offline => WorkerState::Offline,
        }
    }
}

impl From<WorkerState> for WorkerStatus {
    fn from(state: WorkerState) -> Self {
        match state {
            WorkerState::Idle => WorkerStatus::Idle,
            WorkerState::Busy => WorkerStatus::Busy,
            WorkerState::Offline => WorkerStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum UserRole {
    Coordinator,
    WorkerOwner,
    Submitter,
}

impl From<Role> for UserRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Coordinator => UserRole::Coordinator,
            Role::WorkerOwner => UserRole::WorkerOwner,
            Role::Submitter => UserRole::Submitter,
        }
    }
}

impl From<UserRole> for Role {
    fn from(role: UserRole) -> Self {
        match role {
            UserRole::Coordinator => Role::Coordinator,
            UserRole::WorkerOwner => Role::WorkerOwner,
            UserRole::Submitter => Role::Submitter,
        }
    }
}

/// Ledger entry kinds. The ledger is append-only; these are the only
/// reasons a balance may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum LedgerKind {
    SignupGrant,
    JobDebit,
    JobCredit,
    AdminAdjust,
}

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_salt: String,
    pub password_hash: String,
    pub role: UserRole,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub specs_json: String,
    pub status: WorkerState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub jobs_completed: i64,
    pub credits_earned: i64,
    pub created_at: DateTime<Utc>,
}

impl WorkerRow {
    pub fn specs(&self) -> Result<WorkerSpecs, serde_json::Error> {
        serde_json::from_str(&self.specs_json)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub title: String,
    pub submitter_id: String,
    pub code: String,
    pub requirements: String,
    pub demands_json: String,
    pub timeout_seconds: i64,
    pub credit_cost: i64,
    pub credit_reward: i64,
    pub priority: i64,
    pub status: JobState,
    pub assigned_worker_id: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub result_files: Option<String>,
    pub error_log: Option<String>,
    pub sandboxed: Option<bool>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn demands(&self) -> Result<JobDemands, serde_json::Error> {
        serde_json::from_str(&self.demands_json)
    }

    /// Manifest of artifact files produced by the job, empty until settled.
    /// Bytes live on disk under the store's artifact root, keyed by job id.
    pub fn artifacts(&self) -> Result<Vec<StoredArtifact>, serde_json::Error> {
        match self.result_files.as_deref() {
            Some(json) => serde_json::from_str(json),
            None => Ok(Vec::new()),
        }
    }
}

/// One persisted artifact file: bytes are at `path`, which is keyed by the
/// owning job's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub name: String,
    pub size: u64,
    pub path: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub user_id: String,
    pub delta: i64,
    pub kind: LedgerKind,
    pub job_id: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, FromRow)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub timed_out: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_roundtrips_through_protocol_status() {
        for status in JobStatus::ALL {
            let state = JobState::from(*status);
            assert_eq!(JobStatus::from(state), *status);
        }
    }

    #[test]
    fn artifacts_default_to_empty() {
        let row = JobRow {
            id: "j".into(),
            title: "t".into(),
            submitter_id: "u".into(),
            code: String::new(),
            requirements: String::new(),
            demands_json: "{}".into(),
            timeout_seconds: 60,
            credit_cost: 9,
            credit_reward: 9,
            priority: 5,
            status: JobState::Pending,
            assigned_worker_id: None,
            stdout: None,
            stderr: None,
            result_files: None,
            error_log: None,
            sandboxed: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        assert!(row.artifacts().unwrap().is_empty());
    }
}
