//! Canonical default values shared by the coordinator and worker binaries.

/// TCP bind address for worker sessions.
pub const DEFAULT_WORKER_BIND_ADDR: &str = "127.0.0.1:7700";
/// TCP bind address for the dashboard API.
pub const DEFAULT_DASHBOARD_BIND_ADDR: &str = "127.0.0.1:7701";
/// Address workers dial by default.
pub const DEFAULT_COORDINATOR_ADDR: &str = "127.0.0.1:7700";

/// Credits granted to a fresh account.
pub const DEFAULT_STARTING_CREDITS: i64 = 100;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Stall grace defaults to 2x the heartbeat interval.
pub const DEFAULT_STALL_GRACE_FACTOR: u32 = 2;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;
/// A session is considered dead after this many missed heartbeat intervals.
pub const DEFAULT_SESSION_READ_TIMEOUT_FACTOR: u32 = 3;

/// Upper bound on a job's wall-clock timeout.
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_STDOUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 16 * 1024 * 1024;

/// Outbound per-session channel capacity; overflow detaches the session.
pub const DEFAULT_OUTBOUND_CHANNEL_CAP: usize = 32;

/// Share of the cost refunded on a timed-out job, in percent.
pub const DEFAULT_TIMEOUT_REFUND_PERCENT: u8 = 50;

/// Container image jobs run in by default.
pub const DEFAULT_SANDBOX_IMAGE: &str = "python:3.11-slim";
/// Process-count cap inside the sandbox.
pub const DEFAULT_SANDBOX_PIDS_LIMIT: u32 = 256;

/// How often an idle worker polls for work.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
