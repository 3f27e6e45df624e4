//! Protocol payload types shared by coordinator and worker.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Allocate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

opaque_id!(JobId, "Canonical job identifier (opaque string, UUID v4).");
opaque_id!(WorkerId, "Canonical worker identifier, assigned by the coordinator at register.");

// ============================================================================
// Canonical enums
// ============================================================================

/// User role. Determines what the submission API lets a principal see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    WorkerOwner,
    Submitter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::WorkerOwner => "worker_owner",
            Role::Submitter => "submitter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Role::Coordinator),
            "worker_owner" => Ok(Role::WorkerOwner),
            "submitter" => Ok(Role::Submitter),
            _ => Err(format!("invalid role: '{s}'")),
        }
    }
}

/// Job lifecycle status. Monotonic: `pending -> running -> terminal`, with
/// `pending -> cancelled` as the only other edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                next,
                JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
            ),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "timed_out" => Ok(JobStatus::TimedOut),
            _ => Err(format!("invalid job status: '{s}'")),
        }
    }
}

/// Outcome a worker reports for an executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    TimedOut,
}

impl JobOutcome {
    /// The terminal job status this outcome settles to.
    pub fn terminal_status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::TimedOut => JobStatus::TimedOut,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "offline" => Ok(WorkerStatus::Offline),
            _ => Err(format!("invalid worker status: '{s}'")),
        }
    }
}

/// Failure reasons recorded in a job's error log.
pub mod failure_reason {
    pub const WORKER_LOST: &str = "worker_lost";
    pub const OOM: &str = "oom";
    pub const DEPENDENCY: &str = "dependency";
    pub const EXIT: &str = "exit";
    pub const LAUNCH: &str = "launch";
}

// ============================================================================
// Resource profiles
// ============================================================================

/// Resources a worker reports at register time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpecs {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    pub docker_available: bool,
    /// Free-form capability tags (e.g. os=linux). Absent keys are wildcards.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl WorkerSpecs {
    pub fn is_valid(&self) -> bool {
        self.cpu_cores >= 1 && self.ram_gb > 0.0 && self.ram_gb.is_finite()
    }
}

/// Minimum resource profile a worker must meet to receive a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDemands {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub gpu_required: bool,
    #[serde(default)]
    pub docker_required: bool,
    pub timeout_seconds: u64,
    /// Required tags; a worker matches only if every entry is present and
    /// equal in its own tag set.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Validation failures for submitted demands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DemandError {
    #[error("cpu_cores must be at least 1")]
    InvalidCpu,
    #[error("ram_gb must be a positive finite number")]
    InvalidRam,
    #[error("timeout_seconds must be positive")]
    InvalidTimeout,
    #[error("timeout of {requested}s exceeds the maximum of {max}s")]
    TimeoutTooLarge { requested: u64, max: u64 },
}

impl JobDemands {
    /// Resource matching per the scheduler contract: cpu and ram at least
    /// as large as demanded, a named gpu when one is required, docker when
    /// required, and every demanded tag present and equal.
    pub fn matches(&self, specs: &WorkerSpecs) -> bool {
        if specs.cpu_cores < self.cpu_cores {
            return false;
        }
        if specs.ram_gb < self.ram_gb {
            return false;
        }
        if self.gpu_required {
            match specs.gpu_name.as_deref() {
                Some(name) if !name.is_empty() => {}
                _ => return false,
            }
        }
        if self.docker_required && !specs.docker_available {
            return false;
        }
        self.tags
            .iter()
            .all(|(key, value)| specs.tags.get(key) == Some(value))
    }

    /// Credit cost of executing these demands:
    ///
    /// `5 + 2*cpu_cores + ceil(ram_gb) + 10*gpu + ceil(timeout/60)`
    pub fn credit_cost(&self) -> i64 {
        let ram = self.ram_gb.ceil() as i64;
        let gpu = if self.gpu_required { 10 } else { 0 };
        let minutes = self.timeout_seconds.div_ceil(60) as i64;
        5 + 2 * i64::from(self.cpu_cores) + ram + gpu + minutes
    }

    pub fn validate(&self, max_timeout_seconds: u64) -> Result<(), DemandError> {
        if self.cpu_cores < 1 {
            return Err(DemandError::InvalidCpu);
        }
        if !(self.ram_gb > 0.0 && self.ram_gb.is_finite()) {
            return Err(DemandError::InvalidRam);
        }
        if self.timeout_seconds == 0 {
            return Err(DemandError::InvalidTimeout);
        }
        if self.timeout_seconds > max_timeout_seconds {
            return Err(DemandError::TimeoutTooLarge {
                requested: self.timeout_seconds,
                max: max_timeout_seconds,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Artifacts
// ============================================================================

/// A file produced under the sandbox output directory, carried base64 on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub name: String,
    pub bytes_b64: String,
}

impl ArtifactFile {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            bytes_b64: BASE64.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.bytes_b64)
    }
}

// ============================================================================
// Wire messages
// ============================================================================

fn default_sandboxed() -> bool {
    true
}

/// Messages a worker sends to the coordinator.
///
/// The `type` discriminator and field names are the wire contract; unknown
/// types, unknown fields, and missing required fields all fail decoding
/// and close the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WorkerMessage {
    /// Must be the first message on a session.
    Register {
        name: String,
        #[serde(default)]
        owner_token: Option<String>,
        specs: WorkerSpecs,
    },
    Heartbeat {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
    RequestJob {
        worker_id: WorkerId,
    },
    JobResult {
        job_id: JobId,
        outcome: JobOutcome,
        stdout: String,
        stderr: String,
        #[serde(default)]
        files: Vec<ArtifactFile>,
        /// Failure reason slug (`oom`, `dependency`, ...) when the outcome
        /// is not `completed`.
        #[serde(default)]
        reason: Option<String>,
        /// False when the restricted (non-container) fallback executed the
        /// job; persisted for audit.
        #[serde(default = "default_sandboxed")]
        sandboxed: bool,
    },
    Disconnect,
}

/// Messages the coordinator sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CoordinatorMessage {
    Registered {
        worker_id: WorkerId,
    },
    Job {
        job_id: JobId,
        code: String,
        requirements: String,
        demands: JobDemands,
        timeout_seconds: u64,
        credit_reward: i64,
    },
    NoJob,
    JobReceived {
        job_id: JobId,
    },
    /// Best-effort notice sent before a protocol-violation close.
    Error {
        message: String,
    },
}
