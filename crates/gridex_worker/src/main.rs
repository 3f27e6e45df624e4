//! Gridex worker binary.
//!
//! Usage:
//!     gridex-worker --connect 127.0.0.1:7700 --name lab-3 --owner-token <token>

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gridex_protocol::config::WorkerConfig;
use gridex_protocol::defaults;
use gridex_worker::{detect_specs, probe_docker, Sandbox, SandboxConfig, Worker};

#[derive(Parser, Debug)]
#[command(name = "gridex-worker", about = "Worker node for the Gridex compute exchange")]
struct Args {
    /// Coordinator address
    #[arg(long, default_value = defaults::DEFAULT_COORDINATOR_ADDR)]
    connect: String,

    /// Worker name; (owner, name) is the stable identity across reconnects
    #[arg(long)]
    name: Option<String>,

    /// Owner credential; omit to contribute anonymously (earns nothing)
    #[arg(long)]
    owner_token: Option<String>,

    /// Run jobs as bare subprocesses instead of containers (less safe;
    /// results are flagged as unsandboxed)
    #[arg(long)]
    no_sandbox: bool,

    /// Container image for sandboxed jobs
    #[arg(long, default_value = defaults::DEFAULT_SANDBOX_IMAGE)]
    sandbox_image: String,

    /// Scratch space for job working directories
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Advertised CPU cores (defaults to the detected count)
    #[arg(long)]
    cpus: Option<u32>,

    /// Advertised RAM in GiB (defaults to the detected total)
    #[arg(long)]
    ram_gb: Option<f64>,

    /// Advertised GPU name, if one should be offered to gpu jobs
    #[arg(long)]
    gpu_name: Option<String>,

    /// Mirror the full log filter to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    gridex_logging::init_logging("gridex-worker", args.verbose)
        .context("failed to initialize logging")?;

    let name = args.name.unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().to_string();
        format!("worker-{}", &suffix[..8])
    });

    let docker_available = probe_docker().await;
    let use_sandbox = !args.no_sandbox;
    if use_sandbox && !docker_available {
        bail!("docker is required for sandboxed execution; pass --no-sandbox to opt out");
    }

    let mut specs = detect_specs(args.gpu_name, docker_available);
    if let Some(cpus) = args.cpus {
        specs.cpu_cores = cpus;
    }
    if let Some(ram_gb) = args.ram_gb {
        specs.ram_gb = ram_gb;
    }
    if !specs.is_valid() {
        bail!("advertised specs are invalid: need at least 1 cpu and positive ram");
    }

    let config = WorkerConfig {
        coordinator_addr: args.connect,
        name: name.clone(),
        owner_token: args.owner_token,
        use_sandbox,
        sandbox_image: args.sandbox_image,
        work_root: args
            .work_root
            .unwrap_or_else(|| std::env::temp_dir().join("gridex-worker")),
        ..WorkerConfig::default()
    };

    tracing::info!("Starting Gridex worker '{}'", name);
    tracing::info!("  Coordinator: {}", config.coordinator_addr);
    tracing::info!(
        "  Specs: {} cores, {:.1} GiB ram, gpu {}, docker {}",
        specs.cpu_cores,
        specs.ram_gb,
        specs.gpu_name.as_deref().unwrap_or("none"),
        specs.docker_available,
    );
    if !config.use_sandbox {
        tracing::warn!("Sandbox disabled: jobs run as bare subprocesses");
    }

    let sandbox = Sandbox::new(SandboxConfig {
        use_container: config.use_sandbox,
        image: config.sandbox_image.clone(),
        work_root: config.work_root.clone(),
        max_stdout_bytes: config.max_stdout_bytes,
        max_artifact_bytes: config.max_artifact_bytes,
        ..SandboxConfig::default()
    });

    let worker = Worker::new(config, specs, sandbox);
    worker.run().await
}
