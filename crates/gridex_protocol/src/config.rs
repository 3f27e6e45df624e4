//! Runtime configuration for the coordinator and worker binaries.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Refund policy applied when jobs settle unsuccessfully.
#[derive(Debug, Clone, Copy)]
pub struct SettlePolicy {
    /// Refund the submitter when a job fails. Off by default: the cost paid
    /// for an execution attempt stays spent.
    pub refund_on_failure: bool,
    /// Share of the cost refunded on timeout, in percent (rounded down).
    pub timeout_refund_percent: u8,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            refund_on_failure: false,
            timeout_refund_percent: defaults::DEFAULT_TIMEOUT_REFUND_PERCENT,
        }
    }
}

impl SettlePolicy {
    /// Refund owed to the submitter for a timed-out job of the given cost.
    pub fn timeout_refund(&self, cost: i64) -> i64 {
        cost * i64::from(self.timeout_refund_percent) / 100
    }
}

/// Coordinator process configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TCP bind address for worker sessions.
    pub worker_bind: String,
    /// TCP bind address for the dashboard API.
    pub dashboard_bind: String,
    /// SQLite database URL (sqlite:/path/to/gridex.db).
    pub db_url: String,
    /// Credits granted at account creation.
    pub starting_credits: i64,
    pub heartbeat_interval: Duration,
    /// How long a running job's worker may stay silent before the job is
    /// reaped. Defaults to 2x the heartbeat interval.
    pub stall_grace: Duration,
    pub reaper_interval: Duration,
    pub max_timeout_seconds: u64,
    pub max_frame_bytes: usize,
    pub settle_policy: SettlePolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS);
        Self {
            worker_bind: defaults::DEFAULT_WORKER_BIND_ADDR.to_string(),
            dashboard_bind: defaults::DEFAULT_DASHBOARD_BIND_ADDR.to_string(),
            db_url: String::new(),
            starting_credits: defaults::DEFAULT_STARTING_CREDITS,
            heartbeat_interval,
            stall_grace: heartbeat_interval * defaults::DEFAULT_STALL_GRACE_FACTOR,
            reaper_interval: Duration::from_secs(defaults::DEFAULT_REAPER_INTERVAL_SECS),
            max_timeout_seconds: defaults::DEFAULT_MAX_TIMEOUT_SECS,
            max_frame_bytes: defaults::DEFAULT_MAX_FRAME_BYTES,
            settle_policy: SettlePolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Sessions are closed after this long without any inbound frame.
    pub fn session_read_timeout(&self) -> Duration {
        self.heartbeat_interval * defaults::DEFAULT_SESSION_READ_TIMEOUT_FACTOR
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator address to dial.
    pub coordinator_addr: String,
    /// Friendly worker name; (owner, name) is the stable identity across
    /// reconnects.
    pub name: String,
    /// Opaque credential tying earnings to an account; None earns nothing.
    pub owner_token: Option<String>,
    /// Container-mode sandbox. When false the restricted fallback runs and
    /// results are flagged unsandboxed.
    pub use_sandbox: bool,
    pub sandbox_image: String,
    /// Scratch space root for job working directories.
    pub work_root: PathBuf,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub max_frame_bytes: usize,
    pub max_stdout_bytes: usize,
    pub max_artifact_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_addr: defaults::DEFAULT_COORDINATOR_ADDR.to_string(),
            name: String::new(),
            owner_token: None,
            use_sandbox: true,
            sandbox_image: defaults::DEFAULT_SANDBOX_IMAGE.to_string(),
            work_root: std::env::temp_dir().join("gridex-worker"),
            heartbeat_interval: Duration::from_secs(defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            poll_interval: Duration::from_secs(defaults::DEFAULT_POLL_INTERVAL_SECS),
            max_frame_bytes: defaults::DEFAULT_MAX_FRAME_BYTES,
            max_stdout_bytes: defaults::DEFAULT_MAX_STDOUT_BYTES,
            max_artifact_bytes: defaults::DEFAULT_MAX_ARTIFACT_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_refund_rounds_down() {
        let policy = SettlePolicy::default();
        assert_eq!(policy.timeout_refund(9), 4);
        assert_eq!(policy.timeout_refund(10), 5);
        assert_eq!(policy.timeout_refund(0), 0);
    }

    #[test]
    fn stall_grace_defaults_to_twice_heartbeat() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.stall_grace, config.heartbeat_interval * 2);
        assert_eq!(
            config.session_read_timeout(),
            config.heartbeat_interval * 3
        );
    }
}
