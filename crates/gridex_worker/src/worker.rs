//! Worker session: dial the coordinator, register, heartbeat, pull work,
//! execute it in the sandbox, and report results.
//!
//! One select loop owns the socket. Execution runs on a spawned task so
//! heartbeats keep flowing while a job is in flight; the result comes back
//! over a channel and is forwarded as `job_result`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use gridex_protocol::codec::{FrameReader, FrameWriter};
use gridex_protocol::config::WorkerConfig;
use gridex_protocol::error::CodecError;
use gridex_protocol::types::{
    CoordinatorMessage, WorkerMessage, WorkerSpecs, WorkerStatus,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::sandbox::{ExecutableJob, RunOutcome, Sandbox};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);

enum SessionEnd {
    /// Operator asked us to stop; do not reconnect.
    Shutdown,
    /// Server went away or closed the session; reconnect with backoff.
    Lost,
}

pub struct Worker {
    config: WorkerConfig,
    specs: WorkerSpecs,
    sandbox: Arc<Sandbox>,
}

impl Worker {
    pub fn new(config: WorkerConfig, specs: WorkerSpecs, sandbox: Sandbox) -> Self {
        Self {
            config,
            specs,
            sandbox: Arc::new(sandbox),
        }
    }

    /// Run until shut down, reconnecting with exponential backoff whenever
    /// the coordinator goes away.
    pub async fn run(&self) -> Result<()> {
        let mut delay = RECONNECT_BASE_DELAY;
        loop {
            match self.run_session().await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Lost) => {
                    warn!("Lost coordinator, reconnecting in {:?}", delay);
                }
                Err(e) => {
                    warn!("Session failed ({}), reconnecting in {:?}", e, delay);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Worker stopped");
                    return Ok(());
                }
            }
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    async fn run_session(&self) -> Result<SessionEnd> {
        let stream = TcpStream::connect(&self.config.coordinator_addr)
            .await
            .with_context(|| {
                format!("failed to connect to {}", self.config.coordinator_addr)
            })?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.config.max_frame_bytes);
        let mut writer = FrameWriter::new(write_half, self.config.max_frame_bytes);

        writer
            .write(&WorkerMessage::Register {
                name: self.config.name.clone(),
                owner_token: self.config.owner_token.clone(),
                specs: self.specs.clone(),
            })
            .await?;

        let worker_id = match reader.read::<CoordinatorMessage>().await? {
            CoordinatorMessage::Registered { worker_id } => worker_id,
            CoordinatorMessage::Error { message } => {
                bail!("coordinator rejected registration: {message}")
            }
            other => bail!("expected registered, got {other:?}"),
        };
        info!(
            "Registered with {} as {}",
            self.config.coordinator_addr, worker_id
        );

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let (results_tx, mut results_rx) = mpsc::channel::<(String, RunOutcome)>(1);
        let mut busy = false;

        loop {
            tokio::select! {
                message = reader.read::<CoordinatorMessage>() => {
                    let message = match message {
                        Ok(message) => message,
                        Err(CodecError::Closed) => return Ok(SessionEnd::Lost),
                        Err(e) => {
                            error!("Read failed: {}", e);
                            return Ok(SessionEnd::Lost);
                        }
                    };
                    match message {
                        CoordinatorMessage::Job {
                            job_id,
                            code,
                            requirements,
                            demands,
                            timeout_seconds,
                            credit_reward,
                        } => {
                            if busy {
                                // Should not happen: jobs arrive only in
                                // response to request_job.
                                warn!("Received job {} while busy, refusing", job_id);
                                writer
                                    .write(&result_message(
                                        job_id.as_str(),
                                        RunOutcome::launch_failure(
                                            "worker already executing a job",
                                            self.sandbox_mode(),
                                        ),
                                    ))
                                    .await?;
                                continue;
                            }
                            busy = true;
                            info!(
                                "Executing job {} (reward {}, timeout {}s)",
                                job_id, credit_reward, timeout_seconds
                            );
                            let job = ExecutableJob {
                                job_id: job_id.as_str().to_string(),
                                code,
                                requirements,
                                demands,
                                timeout_seconds,
                            };
                            let sandbox = Arc::clone(&self.sandbox);
                            let results = results_tx.clone();
                            tokio::spawn(async move {
                                let outcome = sandbox.run(&job).await;
                                let _ = results.send((job.job_id.clone(), outcome)).await;
                            });
                        }
                        CoordinatorMessage::NoJob => {
                            debug!("No job available");
                        }
                        CoordinatorMessage::JobReceived { job_id } => {
                            debug!("Coordinator acknowledged job {}", job_id);
                        }
                        CoordinatorMessage::Registered { .. } => {
                            warn!("Duplicate registered message ignored");
                        }
                        CoordinatorMessage::Error { message } => {
                            error!("Coordinator error: {}", message);
                            return Ok(SessionEnd::Lost);
                        }
                    }
                }

                Some((job_id, outcome)) = results_rx.recv() => {
                    busy = false;
                    info!("Job {} finished: {}", job_id, outcome.outcome);
                    writer.write(&result_message(&job_id, outcome)).await?;
                }

                _ = heartbeat.tick() => {
                    let status = if busy { WorkerStatus::Busy } else { WorkerStatus::Idle };
                    writer
                        .write(&WorkerMessage::Heartbeat {
                            worker_id: worker_id.clone(),
                            status,
                        })
                        .await?;
                }

                _ = poll.tick(), if !busy => {
                    writer
                        .write(&WorkerMessage::RequestJob {
                            worker_id: worker_id.clone(),
                        })
                        .await?;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Disconnecting from coordinator");
                    let _ = writer.write(&WorkerMessage::Disconnect).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    fn sandbox_mode(&self) -> bool {
        self.config.use_sandbox
    }
}

fn result_message(job_id: &str, outcome: RunOutcome) -> WorkerMessage {
    WorkerMessage::JobResult {
        job_id: job_id.into(),
        outcome: outcome.outcome,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        files: outcome.files,
        reason: outcome.reason,
        sandboxed: outcome.sandboxed,
    }
}

/// Probe the host for a default resource profile. CLI flags override.
pub fn detect_specs(gpu_name: Option<String>, docker_available: bool) -> WorkerSpecs {
    let cpu_cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    WorkerSpecs {
        cpu_cores,
        ram_gb: detect_ram_gb().unwrap_or(4.0),
        gpu_name,
        docker_available,
        tags: Default::default(),
    }
}

#[cfg(target_os = "linux")]
fn detect_ram_gb() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024.0 / 1024.0)
}

#[cfg(not(target_os = "linux"))]
fn detect_ram_gb() -> Option<f64> {
    None
}

/// `docker version` succeeding is the capability signal workers report.
pub async fn probe_docker() -> bool {
    match tokio::process::Command::new("docker")
        .arg("version")
        .arg("--format")
        .arg("{{.Server.Version}}")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}
