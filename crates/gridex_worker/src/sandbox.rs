//! Sandboxed execution of exchange jobs.
//!
//! Container mode is the contract: no network from inside the job, a hard
//! memory cap, a CPU quota, a pids cap, a read-only code mount, a writable
//! scratch directory, and a forceful wall-clock kill. Dependency install
//! runs in a separate, network-enabled container before the job container
//! starts, so user code itself never sees a routable interface.
//!
//! Restricted mode (explicit opt-in) runs the payload as a host subprocess
//! with the same wall-clock kill and nothing else; results carry
//! `sandboxed: false` so the coordinator can record the weaker isolation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use gridex_protocol::types::{failure_reason, ArtifactFile, JobDemands, JobOutcome};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code the kernel reports for an OOM-killed container process.
const OOM_EXIT_CODE: i32 = 137;

const CODE_FILENAME: &str = "main.py";
const REQUIREMENTS_FILENAME: &str = "requirements.txt";

/// A job as received off the wire, ready to execute.
#[derive(Debug, Clone)]
pub struct ExecutableJob {
    pub job_id: String,
    pub code: String,
    pub requirements: String,
    pub demands: JobDemands,
    pub timeout_seconds: u64,
}

/// What the sandbox hands back for settlement.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub outcome: JobOutcome,
    pub reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<ArtifactFile>,
    pub sandboxed: bool,
}

impl RunOutcome {
    pub fn launch_failure(message: impl Into<String>, sandboxed: bool) -> Self {
        Self {
            outcome: JobOutcome::Failed,
            reason: Some(failure_reason::LAUNCH.to_string()),
            stdout: String::new(),
            stderr: message.into(),
            files: Vec::new(),
            sandboxed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container mode when true; restricted host subprocess otherwise.
    pub use_container: bool,
    pub image: String,
    pub work_root: PathBuf,
    pub pids_limit: u32,
    pub max_stdout_bytes: usize,
    pub max_artifact_bytes: usize,
    /// Interpreter used in restricted mode.
    pub interpreter: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        use gridex_protocol::defaults;
        Self {
            use_container: true,
            image: defaults::DEFAULT_SANDBOX_IMAGE.to_string(),
            work_root: std::env::temp_dir().join("gridex-worker"),
            pids_limit: defaults::DEFAULT_SANDBOX_PIDS_LIMIT,
            max_stdout_bytes: defaults::DEFAULT_MAX_STDOUT_BYTES,
            max_artifact_bytes: defaults::DEFAULT_MAX_ARTIFACT_BYTES,
            interpreter: "python3".to_string(),
        }
    }
}

/// Per-job directory layout under the work root.
struct JobDirs {
    root: PathBuf,
    code: PathBuf,
    output: PathBuf,
    scratch: PathBuf,
    deps: PathBuf,
}

enum ExecStatus {
    Finished { code: Option<i32> },
    TimedOut,
}

struct ExecResult {
    status: ExecStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Execute one job to a terminal outcome. Never returns an error: every
    /// failure mode is folded into the outcome so the worker always has
    /// something to report.
    pub async fn run(&self, job: &ExecutableJob) -> RunOutcome {
        let sandboxed = self.config.use_container;
        let dirs = match self.prepare(job) {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!("Job {} staging failed: {}", job.job_id, e);
                return RunOutcome::launch_failure(
                    format!("failed to stage job: {e}"),
                    sandboxed,
                );
            }
        };

        let deadline = Instant::now() + Duration::from_secs(job.timeout_seconds);
        let mut outcome = if sandboxed {
            self.run_container(job, &dirs, deadline).await
        } else {
            self.run_restricted(job, &dirs, deadline).await
        };

        // Artifacts come back regardless of outcome; a partial run may
        // still have produced useful output.
        let (files, dropped) = collect_artifacts(&dirs.output, self.config.max_artifact_bytes);
        outcome.files = files;
        for name in dropped {
            outcome
                .stderr
                .push_str(&format!("\n[artifact '{name}' dropped: over size cap]"));
        }

        if let Err(e) = std::fs::remove_dir_all(&dirs.root) {
            debug!("Failed to clean up job dir {}: {}", dirs.root.display(), e);
        }
        outcome
    }

    fn prepare(&self, job: &ExecutableJob) -> std::io::Result<JobDirs> {
        let root = self.config.work_root.join(&job.job_id);
        let dirs = JobDirs {
            code: root.join("code"),
            output: root.join("output"),
            scratch: root.join("scratch"),
            deps: root.join("deps"),
            root,
        };
        for dir in [&dirs.code, &dirs.output, &dirs.scratch, &dirs.deps] {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(dirs.code.join(CODE_FILENAME), &job.code)?;
        std::fs::write(dirs.code.join(REQUIREMENTS_FILENAME), &job.requirements)?;
        Ok(dirs)
    }

    async fn run_container(
        &self,
        job: &ExecutableJob,
        dirs: &JobDirs,
        deadline: Instant,
    ) -> RunOutcome {
        // Phase 1: dependency install, network up, job mounts read-only.
        if !job.requirements.trim().is_empty() {
            let name = container_name(&job.job_id, "deps");
            let mut install = Command::new("docker");
            install.arg("run").arg("--rm").arg("--name").arg(&name);
            self.resource_args(&mut install, &job.demands);
            install
                .arg("-v")
                .arg(format!("{}:/job:ro", dirs.code.display()))
                .arg("-v")
                .arg(format!("{}:/deps:rw", dirs.deps.display()))
                .arg(&self.config.image)
                .arg("python3")
                .arg("-m")
                .arg("pip")
                .arg("install")
                .arg("--no-cache-dir")
                .arg("--target")
                .arg("/deps")
                .arg("-r")
                .arg(format!("/job/{REQUIREMENTS_FILENAME}"));

            let result = exec_with_deadline(install, deadline, Some(&name)).await;
            match result {
                Ok(ExecResult {
                    status: ExecStatus::Finished { code: Some(0) },
                    ..
                }) => {}
                Ok(ExecResult {
                    status: ExecStatus::TimedOut,
                    stdout,
                    stderr,
                }) => return self.timed_out(stdout, stderr, true),
                Ok(ExecResult { stdout, stderr, .. }) => {
                    info!("Job {} dependency install failed", job.job_id);
                    return self.failed(
                        failure_reason::DEPENDENCY,
                        stdout,
                        stderr,
                        true,
                    );
                }
                Err(e) => {
                    return RunOutcome::launch_failure(
                        format!("failed to launch install container: {e}"),
                        true,
                    )
                }
            }
        }

        // Phase 2: user code, no network, deps and code read-only.
        let name = container_name(&job.job_id, "run");
        let mut run = Command::new("docker");
        run.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("--network")
            .arg("none");
        self.resource_args(&mut run, &job.demands);
        run.arg("-v")
            .arg(format!("{}:/job:ro", dirs.code.display()))
            .arg("-v")
            .arg(format!("{}:/deps:ro", dirs.deps.display()))
            .arg("-v")
            .arg(format!("{}:/job/output:rw", dirs.output.display()))
            .arg("-v")
            .arg(format!("{}:/scratch:rw", dirs.scratch.display()))
            .arg("-w")
            .arg("/scratch")
            .arg("-e")
            .arg("PYTHONPATH=/deps")
            .arg("-e")
            .arg("OUTPUT_DIR=/job/output")
            .arg(&self.config.image)
            .arg("python3")
            .arg(format!("/job/{CODE_FILENAME}"));

        match exec_with_deadline(run, deadline, Some(&name)).await {
            Ok(ExecResult {
                status: ExecStatus::Finished { code: Some(0) },
                stdout,
                stderr,
            }) => self.completed(stdout, stderr, true),
            Ok(ExecResult {
                status: ExecStatus::Finished { code: Some(OOM_EXIT_CODE) },
                stdout,
                stderr,
            }) => self.failed(failure_reason::OOM, stdout, stderr, true),
            Ok(ExecResult {
                status: ExecStatus::Finished { .. },
                stdout,
                stderr,
            }) => self.failed(failure_reason::EXIT, stdout, stderr, true),
            Ok(ExecResult {
                status: ExecStatus::TimedOut,
                stdout,
                stderr,
            }) => self.timed_out(stdout, stderr, true),
            Err(e) => {
                RunOutcome::launch_failure(format!("failed to launch job container: {e}"), true)
            }
        }
    }

    fn resource_args(&self, cmd: &mut Command, demands: &JobDemands) {
        cmd.arg("--memory")
            .arg(format!("{}g", demands.ram_gb))
            .arg("--cpus")
            .arg(demands.cpu_cores.to_string())
            .arg("--pids-limit")
            .arg(self.config.pids_limit.to_string());
        if demands.gpu_required {
            cmd.arg("--gpus").arg("all");
        }
    }

    async fn run_restricted(
        &self,
        job: &ExecutableJob,
        dirs: &JobDirs,
        deadline: Instant,
    ) -> RunOutcome {
        if !job.requirements.trim().is_empty() {
            let mut install = Command::new(&self.config.interpreter);
            install
                .arg("-m")
                .arg("pip")
                .arg("install")
                .arg("--no-cache-dir")
                .arg("--target")
                .arg(&dirs.deps)
                .arg("-r")
                .arg(dirs.code.join(REQUIREMENTS_FILENAME));

            match exec_with_deadline(install, deadline, None).await {
                Ok(ExecResult {
                    status: ExecStatus::Finished { code: Some(0) },
                    ..
                }) => {}
                Ok(ExecResult {
                    status: ExecStatus::TimedOut,
                    stdout,
                    stderr,
                }) => return self.timed_out(stdout, stderr, false),
                Ok(ExecResult { stdout, stderr, .. }) => {
                    return self.failed(failure_reason::DEPENDENCY, stdout, stderr, false)
                }
                Err(e) => {
                    return RunOutcome::launch_failure(
                        format!("failed to launch dependency install: {e}"),
                        false,
                    )
                }
            }
        }

        let mut run = Command::new(&self.config.interpreter);
        run.arg(dirs.code.join(CODE_FILENAME))
            .current_dir(&dirs.scratch)
            .env("PYTHONPATH", &dirs.deps)
            .env("OUTPUT_DIR", &dirs.output);

        match exec_with_deadline(run, deadline, None).await {
            Ok(ExecResult {
                status: ExecStatus::Finished { code: Some(0) },
                stdout,
                stderr,
            }) => self.completed(stdout, stderr, false),
            Ok(ExecResult {
                status: ExecStatus::Finished { .. },
                stdout,
                stderr,
            }) => self.failed(failure_reason::EXIT, stdout, stderr, false),
            Ok(ExecResult {
                status: ExecStatus::TimedOut,
                stdout,
                stderr,
            }) => self.timed_out(stdout, stderr, false),
            Err(e) => {
                RunOutcome::launch_failure(format!("failed to launch subprocess: {e}"), false)
            }
        }
    }

    fn completed(&self, stdout: Vec<u8>, stderr: Vec<u8>, sandboxed: bool) -> RunOutcome {
        self.bundle(JobOutcome::Completed, None, stdout, stderr, sandboxed)
    }

    fn failed(
        &self,
        reason: &str,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        sandboxed: bool,
    ) -> RunOutcome {
        self.bundle(
            JobOutcome::Failed,
            Some(reason.to_string()),
            stdout,
            stderr,
            sandboxed,
        )
    }

    fn timed_out(&self, stdout: Vec<u8>, stderr: Vec<u8>, sandboxed: bool) -> RunOutcome {
        self.bundle(JobOutcome::TimedOut, None, stdout, stderr, sandboxed)
    }

    fn bundle(
        &self,
        outcome: JobOutcome,
        reason: Option<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        sandboxed: bool,
    ) -> RunOutcome {
        let cap = self.config.max_stdout_bytes;
        let (stdout, stdout_truncated) = truncate_capped(stdout, cap);
        let (mut stderr, stderr_truncated) = truncate_capped(stderr, cap);
        if stdout_truncated {
            stderr.push_str("\n[stdout truncated: over size cap]");
        }
        if stderr_truncated {
            stderr.push_str("\n[stderr truncated: over size cap]");
        }
        RunOutcome {
            outcome,
            reason,
            stdout,
            stderr,
            files: Vec::new(),
            sandboxed,
        }
    }
}

/// Run a command with piped output, killing it hard at the deadline. For
/// docker the client is killed and the named container is killed too,
/// since signaling the client alone leaves the container running.
async fn exec_with_deadline(
    mut cmd: Command,
    deadline: Instant,
    container: Option<&str>,
) -> std::io::Result<ExecResult> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let drain_and_wait = async {
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }
        child.wait().await
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout(remaining, drain_and_wait).await {
        Ok(status) => {
            let status = status?;
            Ok(ExecResult {
                status: ExecStatus::Finished {
                    code: status.code(),
                },
                stdout,
                stderr,
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            if let Some(name) = container {
                let _ = Command::new("docker")
                    .arg("kill")
                    .arg(name)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            let _ = child.wait().await;
            Ok(ExecResult {
                status: ExecStatus::TimedOut,
                stdout,
                stderr,
            })
        }
    }
}

fn container_name(job_id: &str, phase: &str) -> String {
    let short: String = job_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(12).collect();
    format!("gridex-{phase}-{short}")
}

/// Lossy-decode and cap a captured stream. Returns the text and whether it
/// was cut.
pub(crate) fn truncate_capped(bytes: Vec<u8>, cap: usize) -> (String, bool) {
    if bytes.len() <= cap {
        return (String::from_utf8_lossy(&bytes).into_owned(), false);
    }
    let text = String::from_utf8_lossy(&bytes[..cap]);
    let mut text = text.into_owned();
    // Drop a possibly mangled trailing char from the lossy cut.
    text.pop();
    (text, true)
}

/// Gather files under the output directory, newest path order not
/// guaranteed, bounded by a total byte cap. Over-cap files are dropped and
/// reported by relative name.
pub(crate) fn collect_artifacts(dir: &Path, total_cap: usize) -> (Vec<ArtifactFile>, Vec<String>) {
    let mut names = Vec::new();
    walk_files(dir, dir, &mut names);
    names.sort();

    let mut files = Vec::new();
    let mut dropped = Vec::new();
    let mut budget = total_cap;
    for name in names {
        let path = dir.join(&name);
        let Ok(bytes) = std::fs::read(&path) else {
            dropped.push(name);
            continue;
        };
        if bytes.len() > budget {
            dropped.push(name);
            continue;
        }
        budget -= bytes.len();
        files.push(ArtifactFile::from_bytes(name, &bytes));
    }
    (files, dropped)
}

fn walk_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_string_lossy().into_owned());
        }
    }
}
