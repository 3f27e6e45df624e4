//! Gridex worker.
//!
//! Contributor-side process: connects to the coordinator, advertises its
//! resources, and executes exchange jobs inside the sandbox.

pub mod sandbox;
pub mod worker;

pub use sandbox::{ExecutableJob, RunOutcome, Sandbox, SandboxConfig};
pub use worker::{detect_specs, probe_docker, Worker};
