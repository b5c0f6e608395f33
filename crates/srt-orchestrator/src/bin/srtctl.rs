//! srtctl: run disaggregated serving benchmarks inside a SLURM allocation

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use srt_core::topology::PortLayout;
use srt_core::{JobConfig, RuntimeContext, Topology};
use srt_orchestrator::{init_logging, Orchestrator};
use srt_runtime::launcher::{Launcher, LocalLauncher, SrunLauncher};
use srt_runtime::slurm::{expand_nodelist, resolve_host_ip, slurm_job_id, slurm_nodelist};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "srtctl")]
#[command(about = "Prefill/decode disaggregated serving benchmarks on SLURM")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log level
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (text or json)
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job in the current allocation
    Run {
        /// Job configuration file
        config: PathBuf,

        /// Job id, defaults to SLURM_JOB_ID
        #[arg(long)]
        job_id: Option<String>,

        /// Node list, compressed or comma separated; defaults to SLURM_JOB_NODELIST
        #[arg(long)]
        nodes: Option<String>,

        /// Log directory, defaults to outputs/<job id>/logs
        #[arg(long, value_name = "DIR")]
        log_dir: Option<PathBuf>,

        /// Address workers use to reach the head node
        #[arg(long)]
        head_ip: Option<String>,

        /// Run every process on this host instead of through srun
        #[arg(long)]
        local: bool,
    },
    /// Validate a configuration file
    Validate {
        /// Job configuration file
        config: PathBuf,
    },
    /// Print endpoint placement and ports without launching anything
    Plan {
        /// Job configuration file
        config: PathBuf,

        /// Node list; defaults to as many placeholder nodes as needed
        #[arg(long)]
        nodes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            ref config,
            ref job_id,
            ref nodes,
            ref log_dir,
            ref head_ip,
            local,
        } => {
            let code = run_job(
                &cli,
                config,
                job_id.clone(),
                nodes.clone(),
                log_dir.clone(),
                head_ip.clone(),
                local,
            )
            .await?;
            std::process::exit(code);
        }
        Commands::Validate { ref config } => validate_config(config),
        Commands::Plan { ref config, ref nodes } => plan_job(config, nodes.as_deref()).await,
    }
}

fn load_config(path: &Path, cli: &Cli) -> anyhow::Result<JobConfig> {
    let mut config = JobConfig::from_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    Ok(config)
}

async fn run_job(
    cli: &Cli,
    config_path: &Path,
    job_id: Option<String>,
    nodes: Option<String>,
    log_dir: Option<PathBuf>,
    head_ip: Option<String>,
    local: bool,
) -> anyhow::Result<i32> {
    let config = load_config(config_path, cli)?;
    init_logging(&config.logging)?;

    let Some(job_id) = job_id.or_else(slurm_job_id) else {
        error!("Not running in SLURM (SLURM_JOB_ID not set) and no --job-id given");
        return Ok(1);
    };
    let Some(raw_nodes) = nodes.or_else(slurm_nodelist) else {
        error!("No node list: set --nodes or run inside an allocation");
        return Ok(1);
    };
    let nodes = expand_nodelist(&raw_nodes).await?;

    let log_dir = log_dir.unwrap_or_else(|| PathBuf::from("outputs").join(&job_id).join("logs"));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let head = nodes.first().cloned().unwrap_or_default();
    let head_ip = match head_ip {
        Some(ip) => ip,
        None => resolve_host_ip(&head).await,
    };
    let ctx = RuntimeContext::new(&config, job_id, nodes, log_dir)?.with_head_ip(head_ip);

    let launcher: Arc<dyn Launcher> = if local {
        info!("Using the local launcher");
        Arc::new(LocalLauncher::new())
    } else {
        Arc::new(SrunLauncher::new())
    };

    let mut orchestrator = match Orchestrator::new(config, ctx, launcher) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("{}", e);
            return Ok(e.exit_code());
        }
    };
    Ok(orchestrator.run().await)
}

fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = JobConfig::from_file(path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Name: {}", config.name);
    println!("Backend: {}", config.backend.name());
    println!("Frontend: {}", config.frontend.frontend_type);
    println!("Workers: {}", config.resources.describe());
    println!("Benchmark: {}", config.benchmark.name());
    Ok(())
}

async fn plan_job(path: &Path, nodes: Option<&str>) -> anyhow::Result<()> {
    let config = JobConfig::from_file(path)?;
    config.validate()?;
    let request = config.backend.resolve_request(&config.resources.to_request()?)?;

    let nodes = match nodes {
        Some(raw) => expand_nodelist(raw).await?,
        None => (0..request.nodes_required()?).map(|i| format!("node{}", i)).collect(),
    };
    if nodes.is_empty() {
        bail!("no nodes to plan on");
    }

    let endpoints = config.backend.allocate_endpoints(&request, &nodes)?;
    let processes = srt_core::endpoints_to_processes(&endpoints, &PortLayout::default())?;
    let topology = Topology { endpoints, processes };

    println!("{} ({}) on {} node(s)", config.name, config.resources.describe(), nodes.len());
    for endpoint in &topology.endpoints {
        println!(
            "{:<12} nodes={} gpus={:?} total_gpus={}",
            endpoint.name(),
            endpoint.nodes.join(","),
            endpoint.gpu_indices,
            endpoint.total_gpus
        );
        for process in topology.processes_for(endpoint) {
            println!(
                "  {:<24} sys={} http={} bootstrap={} event={} dist_init={}",
                process.name(),
                process.sys_port,
                port(process.http_port),
                port(process.bootstrap_port),
                process.event_port,
                port(process.dist_init_port)
            );
        }
    }
    Ok(())
}

fn port(p: Option<u16>) -> String {
    p.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}
