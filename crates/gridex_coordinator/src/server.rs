//! Coordinator process wiring: listeners, accept loops, and the reaper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gridex_db::Store;
use gridex_protocol::codec::{FrameReader, FrameWriter};
use gridex_protocol::config::CoordinatorConfig;
use gridex_protocol::error::CodecError;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::api::{ApiRequest, ApiResponse, ApiService};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::session::{run_session, SessionContext};

/// The assembled coordinator. Owns both listening sockets; `run` drives
/// them until the process is stopped.
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    api: Arc<ApiService>,
    store: Store,
    worker_listener: TcpListener,
    dashboard_listener: TcpListener,
}

impl Coordinator {
    pub async fn bind(config: CoordinatorConfig, store: Store) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::clone(&registry),
            config.settle_policy,
        ));
        let api = Arc::new(ApiService::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));

        let worker_listener = TcpListener::bind(&config.worker_bind)
            .await
            .with_context(|| format!("failed to bind worker listener to {}", config.worker_bind))?;
        let dashboard_listener = TcpListener::bind(&config.dashboard_bind)
            .await
            .with_context(|| {
                format!(
                    "failed to bind dashboard listener to {}",
                    config.dashboard_bind
                )
            })?;

        info!("Worker listener bound to {}", worker_listener.local_addr()?);
        info!(
            "Dashboard listener bound to {}",
            dashboard_listener.local_addr()?
        );

        Ok(Self {
            config,
            registry,
            scheduler,
            api,
            store,
            worker_listener,
            dashboard_listener,
        })
    }

    pub fn worker_addr(&self) -> Result<SocketAddr> {
        Ok(self.worker_listener.local_addr()?)
    }

    pub fn dashboard_addr(&self) -> Result<SocketAddr> {
        Ok(self.dashboard_listener.local_addr()?)
    }

    /// Accept worker sessions and dashboard connections until either
    /// listener fails; the reaper ticks in the background.
    pub async fn run(self) -> Result<()> {
        let reaper = tokio::spawn(Arc::clone(&self.scheduler).run_reaper(
            self.config.reaper_interval,
            self.config.stall_grace,
        ));

        let ctx = SessionContext {
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            config: Arc::clone(&self.config),
        };

        let result = tokio::select! {
            r = accept_workers(self.worker_listener, ctx) => r.context("worker listener failed"),
            r = serve_dashboard(self.dashboard_listener, Arc::clone(&self.api), self.config.max_frame_bytes) => {
                r.context("dashboard listener failed")
            }
        };

        reaper.abort();
        result
    }
}

async fn accept_workers(listener: TcpListener, ctx: SessionContext) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                debug!("Accepted worker connection from {}", peer);
                tokio::spawn(run_session(ctx.clone(), stream, peer));
            }
            Err(e) => {
                error!("Worker accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_dashboard(
    listener: TcpListener,
    api: Arc<ApiService>,
    max_frame_bytes: usize,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted dashboard connection from {}", peer);
                tokio::spawn(handle_dashboard_conn(Arc::clone(&api), stream, max_frame_bytes));
            }
            Err(e) => {
                error!("Dashboard accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// One framed request, one framed response, until the client hangs up.
async fn handle_dashboard_conn(api: Arc<ApiService>, stream: TcpStream, max_frame_bytes: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, max_frame_bytes);
    let mut writer = FrameWriter::new(write_half, max_frame_bytes);

    loop {
        let request: ApiRequest = match reader.read().await {
            Ok(request) => request,
            Err(CodecError::Closed) => break,
            Err(e) => {
                let _ = writer
                    .write(&ApiResponse::error("bad_request", e.to_string()))
                    .await;
                break;
            }
        };
        let response = api.handle(request).await;
        if writer.write(&response).await.is_err() {
            break;
        }
    }
}
