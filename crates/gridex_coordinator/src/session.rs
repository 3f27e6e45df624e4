//! One worker session per accepted socket.
//!
//! A session is a reader loop plus a writer task sharing a bounded outbound
//! channel. The first frame must be `register`; after that, messages are
//! dispatched in arrival order. Violations close the session; a full
//! outbound channel declares it failed (backpressure surfaces as worker
//! loss, never as silent queuing).

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use gridex_db::{JobResultPayload, Store};
use gridex_protocol::codec::{FrameReader, FrameWriter};
use gridex_protocol::config::CoordinatorConfig;
use gridex_protocol::defaults::DEFAULT_OUTBOUND_CHANNEL_CAP;
use gridex_protocol::error::CodecError;
use gridex_protocol::types::{CoordinatorMessage, WorkerMessage, WorkerStatus};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::registry::{ConnectedWorker, Registry};
use crate::scheduler::{ScheduleError, Scheduler};

/// Shared dependencies handed to every session.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Store,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<CoordinatorConfig>,
}

enum Flow {
    Continue,
    Graceful,
}

#[derive(Debug, Error)]
enum SessionError {
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("outbound channel overflow")]
    Overflow,
}

/// Drive one worker connection to completion.
pub async fn run_session(ctx: SessionContext, stream: TcpStream, peer: SocketAddr) {
    let read_timeout = ctx.config.session_read_timeout();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, ctx.config.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half, ctx.config.max_frame_bytes);

    // Registration handshake, still on the bare writer.
    let first: WorkerMessage = match timeout(read_timeout, reader.read()).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            debug!("Session from {} ended before register: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Session from {} timed out before register", peer);
            return;
        }
    };
    let WorkerMessage::Register {
        name,
        owner_token,
        specs,
    } = first
    else {
        let _ = writer
            .write(&CoordinatorMessage::Error {
                message: "first message must be register".to_string(),
            })
            .await;
        return;
    };
    if !specs.is_valid() {
        let _ = writer
            .write(&CoordinatorMessage::Error {
                message: "invalid worker specs".to_string(),
            })
            .await;
        return;
    }

    let owner_id = match owner_token.as_deref() {
        Some(token) => match ctx.store.user_by_token(token).await {
            Ok(Some(user)) => Some(user.id),
            Ok(None) => {
                let _ = writer
                    .write(&CoordinatorMessage::Error {
                        message: "unknown owner token".to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                error!("Owner token lookup failed: {}", e);
                let _ = writer
                    .write(&CoordinatorMessage::Error {
                        message: "service unavailable".to_string(),
                    })
                    .await;
                return;
            }
        },
        None => None,
    };

    let row = match ctx
        .store
        .register_worker(owner_id.as_deref(), &name, &specs, Utc::now())
        .await
    {
        Ok(row) => row,
        Err(e) => {
            error!("Worker registration failed for '{}': {}", name, e);
            let _ = writer
                .write(&CoordinatorMessage::Error {
                    message: "service unavailable".to_string(),
                })
                .await;
            return;
        }
    };
    let worker_id = row.id.clone();

    // Writer task drains the bounded outbound channel.
    let (tx, mut rx) = mpsc::channel::<CoordinatorMessage>(DEFAULT_OUTBOUND_CHANNEL_CAP);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.write(&msg).await {
                debug!("Session write failed: {}", e);
                break;
            }
        }
    });

    ctx.registry.attach(ConnectedWorker {
        worker_id: worker_id.clone(),
        owner_id,
        specs,
        status: WorkerStatus::Idle,
        assigned_job_id: None,
        last_heartbeat: Utc::now(),
        sender: tx.clone(),
    });
    info!("Worker '{}' attached as {} from {}", name, worker_id, peer);

    let mut graceful = false;
    if tx
        .try_send(CoordinatorMessage::Registered {
            worker_id: worker_id.clone().into(),
        })
        .is_ok()
    {
        loop {
            let msg = match timeout(read_timeout, reader.read::<WorkerMessage>()).await {
                Err(_) => {
                    warn!("Worker {} stopped heartbeating, detaching", worker_id);
                    break;
                }
                Ok(Err(CodecError::Closed)) => {
                    debug!("Worker {} socket closed", worker_id);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Closing session of worker {}: {}", worker_id, e);
                    let _ = tx.try_send(CoordinatorMessage::Error {
                        message: e.to_string(),
                    });
                    break;
                }
                Ok(Ok(msg)) => msg,
            };

            match handle_message(&ctx, &worker_id, &tx, msg).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Graceful) => {
                    graceful = true;
                    break;
                }
                Err(SessionError::Violation(message)) => {
                    warn!("Protocol violation from worker {}: {}", worker_id, message);
                    let _ = tx.try_send(CoordinatorMessage::Error { message });
                    break;
                }
                Err(SessionError::Overflow) => {
                    warn!("Outbound channel overflow, failing session of {}", worker_id);
                    break;
                }
            }
        }
    }

    // The registry entry goes away now; any job still assigned is left for
    // the reaper so a reconnecting worker can still deliver a late result
    // inside the grace window.
    ctx.registry.detach(&worker_id);
    if let Err(e) = ctx.store.mark_worker_offline(&worker_id, Utc::now()).await {
        error!("Failed to mark worker {} offline: {}", worker_id, e);
    }
    drop(tx);
    let _ = writer_task.await;
    if graceful {
        info!("Worker {} disconnected", worker_id);
    } else {
        info!("Worker {} detached", worker_id);
    }
}

async fn handle_message(
    ctx: &SessionContext,
    session_worker_id: &str,
    tx: &mpsc::Sender<CoordinatorMessage>,
    msg: WorkerMessage,
) -> Result<Flow, SessionError> {
    match msg {
        WorkerMessage::Register { .. } => Err(SessionError::Violation(
            "register is only valid as the first message".to_string(),
        )),

        WorkerMessage::Heartbeat { worker_id, status } => {
            ensure_same_worker(session_worker_id, worker_id.as_str())?;
            let now = Utc::now();
            ctx.registry.heartbeat(session_worker_id, status, now);
            if let Err(e) = ctx.store.worker_heartbeat(session_worker_id, status, now).await {
                warn!("Failed to persist heartbeat of {}: {}", session_worker_id, e);
            }
            Ok(Flow::Continue)
        }

        WorkerMessage::RequestJob { worker_id } => {
            ensure_same_worker(session_worker_id, worker_id.as_str())?;
            match ctx.scheduler.assign(session_worker_id).await {
                Ok(Some(job)) => {
                    let demands = match job.demands() {
                        Ok(demands) => demands,
                        Err(e) => {
                            error!("Job {} has undecodable demands: {}", job.id, e);
                            ctx.scheduler
                                .rollback_assignment(session_worker_id, &job.id)
                                .await;
                            return send_or_overflow(tx, service_unavailable());
                        }
                    };
                    let message = CoordinatorMessage::Job {
                        job_id: job.id.clone().into(),
                        code: job.code.clone(),
                        requirements: job.requirements.clone(),
                        timeout_seconds: job.timeout_seconds as u64,
                        credit_reward: job.credit_reward,
                        demands,
                    };
                    if tx.try_send(message).is_err() {
                        ctx.scheduler
                            .rollback_assignment(session_worker_id, &job.id)
                            .await;
                        return Err(SessionError::Overflow);
                    }
                    Ok(Flow::Continue)
                }
                Ok(None) => send_or_overflow(tx, CoordinatorMessage::NoJob),
                Err(e) => {
                    error!("Assignment for {} failed: {}", session_worker_id, e);
                    send_or_overflow(tx, service_unavailable())
                }
            }
        }

        WorkerMessage::JobResult {
            job_id,
            outcome,
            stdout,
            stderr,
            files,
            reason,
            sandboxed,
        } => {
            let result = JobResultPayload {
                stdout,
                stderr,
                files,
                error_log: reason,
                sandboxed,
            };
            match ctx
                .scheduler
                .settle(session_worker_id, job_id.as_str(), outcome, result)
                .await
            {
                // A dropped late delivery still gets the ack so the worker
                // can move on.
                Ok(_) => send_or_overflow(tx, CoordinatorMessage::JobReceived { job_id }),
                Err(ScheduleError::WrongWorker { .. }) => Err(SessionError::Violation(format!(
                    "job {} is not assigned to this worker",
                    job_id
                ))),
                Err(ScheduleError::Store(gridex_db::StoreError::JobNotFound(_))) => Err(
                    SessionError::Violation(format!("unknown job {}", job_id)),
                ),
                Err(e) => {
                    error!("Settle of job {} failed: {}", job_id, e);
                    send_or_overflow(tx, service_unavailable())
                }
            }
        }

        WorkerMessage::Disconnect => Ok(Flow::Graceful),
    }
}

fn ensure_same_worker(session: &str, claimed: &str) -> Result<(), SessionError> {
    if session == claimed {
        Ok(())
    } else {
        Err(SessionError::Violation(format!(
            "worker id '{claimed}' does not match the session identity"
        )))
    }
}

fn send_or_overflow(
    tx: &mpsc::Sender<CoordinatorMessage>,
    msg: CoordinatorMessage,
) -> Result<Flow, SessionError> {
    if tx.try_send(msg).is_err() {
        return Err(SessionError::Overflow);
    }
    Ok(Flow::Continue)
}

fn service_unavailable() -> CoordinatorMessage {
    CoordinatorMessage::Error {
        message: "service unavailable".to_string(),
    }
}
