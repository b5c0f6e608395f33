//! Frontend layer and server readiness

use crate::{JobError, Orchestrator, Result};
use srt_core::frontend::{frontend_launches, NGINX_PROCESS_NAME};
use srt_core::{FrontendType, RuntimeContext};
use srt_runtime::health::{HealthSchema, ReadinessOutcome, ReadinessProber};
use tracing::{error, info};

/// nginx config written to the log directory
pub const NGINX_CONFIG_FILE: &str = "nginx.conf";

/// Command installing nginx in the container and running it in the foreground
pub fn nginx_command(ctx: &RuntimeContext) -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        format!(
            "apt-get update -qq && apt-get install -y -qq nginx && nginx -c {} -g 'daemon off;'",
            ctx.container_log_path(NGINX_CONFIG_FILE)
        ),
    ]
}

/// `srun` lines attaching a shell to each node of the job
pub fn connection_commands(ctx: &RuntimeContext) -> Vec<(String, String)> {
    let mut container_args = format!("--container-image={}", ctx.container_image);
    let mounts = ctx.mount_spec();
    if !mounts.is_empty() {
        container_args.push_str(&format!(" --container-mounts={}", mounts));
    }
    ctx.nodes
        .iter()
        .map(|node| {
            (
                node.clone(),
                format!(
                    "srun {} --jobid {} -w {} --overlap --pty bash",
                    container_args, ctx.job_id, node
                ),
            )
        })
        .collect()
}

impl Orchestrator {
    /// Start nginx when the plan calls for it, then every frontend
    pub(crate) async fn start_frontends(&self) -> Result<()> {
        self.ensure_not_cancelled("starting frontends").await?;
        let plan = &self.frontend_plan;

        if let Some(node) = &plan.nginx_node {
            info!(
                "Starting nginx on {} in front of {} frontend(s) on {}",
                node,
                plan.frontend_nodes.len(),
                plan.frontend_nodes.join(", ")
            );
            tokio::fs::create_dir_all(&self.ctx.log_dir).await?;
            let config_path = self.ctx.log_path(NGINX_CONFIG_FILE);
            tokio::fs::write(&config_path, plan.render_nginx_config()).await?;

            let log_file = format!("{}_nginx.out", node);
            let mut request = self.request(nginx_command(&self.ctx), vec![node.clone()], &log_file);
            request.wrap_in_bash = false;
            let process = self.spawn(NGINX_PROCESS_NAME, node.clone(), request, true).await?;
            self.registry.add(process).await;
        }

        let frontend_type = self.config.frontend.frontend_type;
        for launch in frontend_launches(&self.config.frontend, plan, &self.topology, &self.ctx) {
            info!("Starting {} on {}", launch.name, launch.node);
            let mut request = self
                .request(launch.command, vec![launch.node.clone()], &launch.log_file)
                .with_env(launch.env);
            if frontend_type == FrontendType::Dynamo {
                request = request.with_preamble(self.ctx.preamble.clone());
            }
            info!("Frontend command: {}", request.display_command());
            let process = self.spawn(launch.name, launch.node, request, true).await?;
            self.registry.add(process).await;
        }
        Ok(())
    }

    pub(crate) fn print_connection_info(&self) {
        info!("Frontend URL: {}", self.ctx.frontend_url());
        for (node, command) in connection_commands(&self.ctx) {
            info!("To connect to {}: {}", node, command);
        }
    }

    /// Block until the frontend reports every expected worker
    pub(crate) async fn wait_for_server(&self) -> Result<()> {
        let hc = &self.config.health_check;
        let (expected_prefill, expected_decode) = self.request.readiness_targets();
        info!(
            "Waiting for server health (expecting {} workers: {})...",
            self.config.resources.total_workers(),
            self.config.resources.describe()
        );

        let prober = ReadinessProber::new(
            &self.ctx.head_node_ip,
            self.ctx.frontend_port,
            HealthSchema::from(self.ctx.frontend_type),
            hc.interval(),
            hc.timeout(),
        )?
        .with_report_every(hc.report_every());

        match prober.wait_for_model(expected_prefill, expected_decode, &self.cancel).await {
            ReadinessOutcome::Ready(_) => {
                info!("Server is healthy");
                Ok(())
            }
            ReadinessOutcome::TimedOut { waited, last } => {
                let detail = last
                    .map(|r| r.message)
                    .unwrap_or_else(|| format!("no valid response from {}", prober.url()));
                error!("Server did not become healthy after {:?}: {}", waited, detail);
                Err(JobError::ReadinessTimeout(detail))
            }
            ReadinessOutcome::Cancelled => Err(self.cancellation_error("waiting for readiness").await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::{load_config, local_context, serve_instances, FakeLauncher, DISAGG_YAML};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_nginx_and_frontends_across_nodes() {
        let yaml = DISAGG_YAML.replace("enable_multiple_frontends: false", "num_additional_frontends: 1");
        let dir = TempDir::new().unwrap();
        let mut config = load_config(dir.path(), &yaml);
        let (mut ctx, _listeners) = local_context(&mut config, dir.path()).await;
        ctx.nodes = (0..4).map(|i| format!("node{}", i)).collect();
        let launcher = Arc::new(FakeLauncher::default());
        let orch = Orchestrator::new(config, ctx, launcher.clone()).unwrap();

        orch.start_frontends().await.unwrap();
        assert_eq!(
            orch.registry().names().await,
            vec!["nginx", "frontend_0", "frontend_1"]
        );

        let requests = launcher.requests();
        assert_eq!(requests[0].nodes, vec!["node0"]);
        assert!(!requests[0].wrap_in_bash);
        assert!(requests[0].command[2].contains("nginx -c /logs/nginx.conf"));
        assert!(requests[1].output.ends_with("node1_frontend_0.out"));
        assert!(requests[2].output.ends_with("node2_frontend_1.out"));
        assert!(requests[1].command.contains(&"--http-port=8080".to_string()));
        assert!(requests[1].env.contains_key("ETCD_ENDPOINTS"));

        let rendered = std::fs::read_to_string(dir.path().join(NGINX_CONFIG_FILE)).unwrap();
        assert!(rendered.contains("node1:8080"));
        assert!(rendered.contains("node2:8080"));
        assert!(!rendered.contains("node3:8080"));
    }

    #[tokio::test]
    async fn test_wait_for_server_counts() {
        let dir = TempDir::new().unwrap();
        let mut config = load_config(dir.path(), DISAGG_YAML);
        let (mut ctx, _listeners) = local_context(&mut config, dir.path()).await;
        ctx.frontend_port = serve_instances(&["prefill", "decode", "decode", "decode"]).await;
        let orch = Orchestrator::new(config, ctx, Arc::new(FakeLauncher::default())).unwrap();
        orch.wait_for_server().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_server_cancelled() {
        let dir = TempDir::new().unwrap();
        let mut config = load_config(dir.path(), DISAGG_YAML);
        let (mut ctx, _listeners) = local_context(&mut config, dir.path()).await;
        ctx.frontend_port = serve_instances(&[]).await;
        let orch = Orchestrator::new(config, ctx, Arc::new(FakeLauncher::default())).unwrap();

        orch.cancel_token().cancel();
        let err = orch.wait_for_server().await.unwrap_err();
        assert!(matches!(err, JobError::Cancelled(_)));
    }

    #[test]
    fn test_connection_commands() {
        let dir = TempDir::new().unwrap();
        let config = load_config(dir.path(), DISAGG_YAML);
        let nodes = vec!["gpu-01".to_string(), "gpu-02".to_string()];
        let ctx = RuntimeContext::new(&config, "991", nodes, dir.path().to_path_buf()).unwrap();

        let commands = connection_commands(&ctx);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].0, "gpu-02");
        assert!(commands[1].1.starts_with("srun --container-image=sglang.sqsh --container-mounts="));
        assert!(commands[1].1.ends_with("--jobid 991 -w gpu-02 --overlap --pty bash"));
    }
}
