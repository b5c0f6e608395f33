//! Benchmark stage: manual idle mode or one benchmark run on the head node

use crate::{JobError, Orchestrator, Result};
use srt_runtime::launcher::shell_join;
use srt_runtime::ManagedProcess;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

pub const BENCHMARK_PROCESS_NAME: &str = "benchmark";
pub const BENCHMARK_LOG: &str = "benchmark.out";

/// Exit code reported when the benchmark overruns its timeout
const BENCHMARK_TIMEOUT_CODE: i32 = 124;

impl Orchestrator {
    pub(crate) async fn run_benchmark(&self) -> Result<()> {
        let benchmark = &self.config.benchmark;
        if benchmark.is_manual() {
            return self.idle_until_stopped().await;
        }

        let errors = benchmark.validate();
        if !errors.is_empty() {
            for e in &errors {
                error!("Config error: {}", e);
            }
            return Err(JobError::Configuration(errors.join("; ")));
        }
        let command = benchmark.build_command(&self.ctx).ok_or_else(|| {
            JobError::Configuration(format!("{} benchmark has no command", benchmark.name()))
        })?;

        info!("Running {} benchmark", benchmark.name());
        if let Some(script) = benchmark.script_path() {
            info!("Script: {}", script);
        }
        info!("Command: {}", shell_join(&command));
        info!("Log: {}", self.ctx.log_path(BENCHMARK_LOG).display());

        let head = self.ctx.head_node().to_string();
        let mut request = self.request(command, vec![head.clone()], BENCHMARK_LOG);
        request.wrap_in_bash = false;
        let mut process = self.spawn(BENCHMARK_PROCESS_NAME, head, request, false).await?;

        let outcome = self.wait_benchmark(&mut process).await;
        self.registry.add(process).await;

        let code = outcome?;
        if code != 0 {
            error!("Benchmark failed with exit code {}", code);
            return Err(JobError::BenchmarkFailure { code });
        }
        info!("Benchmark completed successfully");
        Ok(())
    }

    /// Poll the benchmark until it exits, the job is cancelled or it times out
    async fn wait_benchmark(&self, process: &mut ManagedProcess) -> Result<i32> {
        let poll = self.config.supervisor.benchmark_poll();
        let deadline = self.config.supervisor.benchmark_timeout().map(|t| Instant::now() + t);
        let grace = self.config.supervisor.terminate_grace();

        loop {
            if let Some(code) = process.poll() {
                return Ok(code);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Benchmark exceeded its timeout, terminating");
                process.stop(grace).await;
                return Err(JobError::BenchmarkFailure {
                    code: BENCHMARK_TIMEOUT_CODE,
                });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Stop requested, terminating benchmark");
                    process.stop(grace).await;
                    return Err(self.cancellation_error("running the benchmark").await);
                }
                _ = sleep(poll) => {}
            }
        }
    }

    /// Manual mode: keep the server up until stopped or a worker dies
    async fn idle_until_stopped(&self) -> Result<()> {
        info!("Benchmark type is 'manual', server is ready for testing");
        info!("Frontend URL: {}", self.ctx.frontend_url());
        info!("Press Ctrl+C to stop the job");

        let poll = self.config.supervisor.manual_poll();
        loop {
            if self.registry.check_failures().await {
                error!("Worker failure detected during manual mode");
                return Err(JobError::Launch("critical process exited during manual mode".to_string()));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(poll) => {}
            }
        }

        if self.registry.has_failed().await {
            error!("Worker failure detected during manual mode");
            return Err(JobError::Launch("critical process exited during manual mode".to_string()));
        }
        info!("Manual mode stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{load_config, local_context, FakeLauncher, DISAGG_YAML};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn orchestrator(yaml: &str, launcher: Arc<FakeLauncher>) -> (Orchestrator, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = load_config(dir.path(), yaml);
        let (ctx, _listeners) = local_context(&mut config, dir.path()).await;
        let orch = Orchestrator::new(config, ctx, launcher).unwrap();
        (orch, dir)
    }

    #[tokio::test]
    async fn test_benchmark_exit_code_propagates() {
        let launcher = Arc::new(FakeLauncher {
            exits: vec![("benchmark.out", 2)],
            ..FakeLauncher::default()
        });
        let (orch, _dir) = orchestrator(DISAGG_YAML, launcher.clone()).await;

        let err = orch.run_benchmark().await.unwrap_err();
        assert!(matches!(err, JobError::BenchmarkFailure { code: 2 }));

        let request = &launcher.requests()[0];
        assert_eq!(request.command, vec!["bash", "-c", "exit 0"]);
        assert_eq!(request.nodes, vec!["node0"]);
        assert_eq!(orch.registry().exit_code(BENCHMARK_PROCESS_NAME).await, Some(2));
    }

    #[tokio::test]
    async fn test_cancel_terminates_benchmark() {
        let launcher = Arc::new(FakeLauncher::default());
        let (orch, _dir) = orchestrator(DISAGG_YAML, launcher.clone()).await;

        let cancel = orch.cancel_token();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = orch.run_benchmark().await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled(_)));
        assert_eq!(launcher.handles()[0].exited(), Some(143));
    }

    #[tokio::test]
    async fn test_benchmark_timeout() {
        let yaml = DISAGG_YAML.replace(
            "cleanup_timeout_seconds: 3",
            "cleanup_timeout_seconds: 3\n  benchmark_timeout_seconds: 0",
        );
        let launcher = Arc::new(FakeLauncher::default());
        let (orch, _dir) = orchestrator(&yaml, launcher.clone()).await;

        let err = orch.run_benchmark().await.unwrap_err();
        assert!(matches!(err, JobError::BenchmarkFailure { code: 124 }));
        assert!(launcher.handles()[0].exited().is_some());
    }

    #[tokio::test]
    async fn test_manual_mode_returns_on_cancel() {
        let yaml = DISAGG_YAML.replace("type: custom\n  command: \"exit 0\"", "type: manual");
        let launcher = Arc::new(FakeLauncher::default());
        let (orch, _dir) = orchestrator(&yaml, launcher.clone()).await;

        orch.cancel_token().cancel();
        orch.run_benchmark().await.unwrap();
        assert!(launcher.requests().is_empty());
    }
}
