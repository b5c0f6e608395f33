//! Job state machine
//!
//! One [`Orchestrator`] runs one job. Stages execute strictly in order, every
//! blocking wait observes the shared cancellation token, and cleanup runs on
//! every path out of [`Orchestrator::run`].

use crate::{JobError, Result};
use srt_core::topology::{endpoints_to_processes, ResourceRequest};
use srt_core::{FrontendPlan, JobConfig, RuntimeContext, Topology};
use srt_runtime::launcher::{LaunchRequest, Launcher};
use srt_runtime::signals::spawn_signal_handler;
use srt_runtime::{spawn_monitor, CancellationToken, ManagedProcess, ProcessRegistry};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Orchestration stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    HeadInfraUp,
    WorkersLaunched,
    FrontendLaunched,
    ServerReady,
    BenchmarkRunning,
    Complete,
    Failed,
    Cleanup,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::HeadInfraUp => "HEAD_INFRA_UP",
            Stage::WorkersLaunched => "WORKERS_LAUNCHED",
            Stage::FrontendLaunched => "FRONTEND_LAUNCHED",
            Stage::ServerReady => "SERVER_READY",
            Stage::BenchmarkRunning => "BENCHMARK_RUNNING",
            Stage::Complete => "COMPLETE",
            Stage::Failed => "FAILED",
            Stage::Cleanup => "CLEANUP",
            Stage::Done => "DONE",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs one benchmark job from head infrastructure to cleanup
pub struct Orchestrator {
    pub(crate) config: JobConfig,
    pub(crate) ctx: RuntimeContext,
    pub(crate) request: ResourceRequest,
    pub(crate) topology: Topology,
    pub(crate) frontend_plan: FrontendPlan,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) cancel: CancellationToken,
    stage: Stage,
    history: Vec<Stage>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("job_id", &self.ctx.job_id)
            .field("stage", &self.stage)
            .field("endpoints", &self.topology.endpoints.len())
            .field("processes", &self.topology.processes.len())
            .finish()
    }
}

impl Orchestrator {
    /// Validate the config and plan the whole job up front.
    ///
    /// Allocation and port assignment happen here, so an unsatisfiable
    /// request fails before anything is launched.
    pub fn new(config: JobConfig, ctx: RuntimeContext, launcher: Arc<dyn Launcher>) -> Result<Self> {
        config.validate()?;

        let request = config.backend.resolve_request(&config.resources.to_request()?)?;
        let endpoints = config.backend.allocate_endpoints(&request, &ctx.nodes)?;
        let processes = endpoints_to_processes(&endpoints, &ctx.ports)?;
        let topology = Topology { endpoints, processes };
        let frontend_plan = FrontendPlan::compute(&config.frontend, &ctx.nodes)?;

        let registry = Arc::new(ProcessRegistry::new(
            config.supervisor.terminate_grace(),
            config.supervisor.cleanup_timeout(),
        ));

        Ok(Self {
            config,
            ctx,
            request,
            topology,
            frontend_plan,
            launcher,
            registry,
            cancel: CancellationToken::new(),
            stage: Stage::Init,
            history: vec![Stage::Init],
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn frontend_plan(&self) -> &FrontendPlan {
        &self.frontend_plan
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        self.registry.clone()
    }

    /// Token that aborts the job when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    fn enter(&mut self, stage: Stage) {
        info!("Stage {} -> {}", self.stage, stage);
        self.stage = stage;
        self.history.push(stage);
    }

    /// Run the job and return its process exit code
    pub async fn run(&mut self) -> i32 {
        self.log_summary();

        let monitor = spawn_monitor(
            self.registry.clone(),
            self.cancel.clone(),
            self.config.supervisor.monitor_interval(),
        );
        let signals = spawn_signal_handler(self.cancel.clone());

        let exit_code = match self.run_stages().await {
            Ok(()) => {
                self.enter(Stage::Complete);
                0
            }
            Err(e) => {
                error!("Job failed in {} ({}): {}", self.stage, e.category(), e);
                self.enter(Stage::Failed);
                e.exit_code()
            }
        };

        self.enter(Stage::Cleanup);
        // stops the monitor and signal tasks
        self.cancel.cancel();
        for task in [monitor, signals] {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
        self.registry.cleanup().await;
        if exit_code != 0 {
            self.registry.print_failure_details().await;
        }

        self.enter(Stage::Done);
        info!("Job {} finished with exit code {}", self.ctx.run_name, exit_code);
        exit_code
    }

    async fn run_stages(&mut self) -> Result<()> {
        self.enter(Stage::HeadInfraUp);
        self.start_head_infrastructure().await?;

        self.enter(Stage::WorkersLaunched);
        self.start_workers().await?;

        self.enter(Stage::FrontendLaunched);
        self.start_frontends().await?;
        self.print_connection_info();

        self.enter(Stage::ServerReady);
        self.wait_for_server().await?;

        self.enter(Stage::BenchmarkRunning);
        self.run_benchmark().await
    }

    fn log_summary(&self) {
        info!("Job ID: {}", self.ctx.job_id);
        info!("Run name: {}", self.ctx.run_name);
        info!("Config: {}", self.config.name);
        info!("Backend: {}", self.config.backend.name());
        info!("Workers: {}", self.config.resources.describe());
        info!("Head node: {}", self.ctx.head_node());
        info!("Nodes: {}", self.ctx.nodes.join(", "));
        info!("Log directory: {}", self.ctx.log_dir.display());
        for endpoint in &self.topology.endpoints {
            debug!(
                "{} on {} with GPUs {:?}",
                endpoint.name(),
                endpoint.nodes.join(","),
                endpoint.gpu_indices
            );
        }
    }

    /// Request for a command in the job container, logging to `log_file`
    pub(crate) fn request(&self, command: Vec<String>, nodes: Vec<String>, log_file: &str) -> LaunchRequest {
        LaunchRequest::new(command, nodes, self.ctx.log_path(log_file))
            .with_container(self.ctx.container_image.clone(), self.ctx.container_mounts.clone())
    }

    /// Launch a request and wrap its handle
    pub(crate) async fn spawn(
        &self,
        name: impl Into<String>,
        node: impl Into<String>,
        request: LaunchRequest,
        critical: bool,
    ) -> Result<ManagedProcess> {
        let name = name.into();
        let log_file = request.output.clone();
        let handle = self
            .launcher
            .launch(request)
            .await
            .map_err(|e| JobError::Launch(format!("{}: {}", name, e)))?;
        Ok(ManagedProcess::new(name, handle, log_file, node, critical))
    }

    /// The error to report once the token has fired
    pub(crate) async fn cancellation_error(&self, during: &str) -> JobError {
        if self.registry.has_failed().await {
            JobError::Launch(format!("critical process exited while {}", during))
        } else {
            JobError::Cancelled(format!("stop requested while {}", during))
        }
    }

    pub(crate) async fn ensure_not_cancelled(&self, during: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.cancellation_error(during).await);
        }
        Ok(())
    }
}
