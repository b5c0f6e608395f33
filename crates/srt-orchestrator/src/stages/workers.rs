//! Worker launch, grouped by endpoint

use crate::{JobError, Orchestrator, Result};
use srt_core::topology::Process;
use srt_core::{BackendKind, RuntimeContext};
use srt_runtime::ManagedProcess;
use std::collections::BTreeMap;
use tracing::{error, info};

/// Log file name of a worker process
pub fn worker_log_file(process: &Process) -> String {
    format!("{}_{}_w{}.out", process.node, process.role, process.endpoint_index)
}

/// Environment for one worker process.
///
/// Config environment overrides backend role environment.
pub fn worker_environment(process: &Process, backend: &BackendKind, ctx: &RuntimeContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("HEAD_NODE_IP".to_string(), ctx.head_node_ip.clone());
    env.insert("ETCD_ENDPOINTS".to_string(), ctx.etcd_endpoints());
    env.insert("NATS_SERVER".to_string(), ctx.nats_server());
    env.insert("DYN_SYSTEM_PORT".to_string(), process.sys_port.to_string());
    env.extend(backend.environment_for_role(process.role));
    env.extend(ctx.environment.clone());

    if (process.gpu_indices.len() as u32) < ctx.gpus_per_node {
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), process.cuda_visible_devices());
    }
    env
}

impl Orchestrator {
    /// Launch every worker, one endpoint at a time.
    ///
    /// If any process of an endpoint fails to launch, its already started
    /// siblings are stopped before the error is returned.
    pub(crate) async fn start_workers(&self) -> Result<()> {
        for endpoint in &self.topology.endpoints {
            self.ensure_not_cancelled("starting workers").await?;
            info!(
                "Starting {} on {} ({} GPUs)",
                endpoint.name(),
                endpoint.nodes.join(","),
                endpoint.total_gpus
            );

            let mut launched: Vec<ManagedProcess> = Vec::new();
            let mut failure = None;
            for process in self.topology.processes_for(endpoint) {
                match self.start_worker(process).await {
                    Ok(managed) => launched.push(managed),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if let Some(err) = failure {
                error!(
                    "{} failed to start, stopping {} started sibling(s)",
                    endpoint.name(),
                    launched.len()
                );
                let grace = self.config.supervisor.terminate_grace();
                for sibling in launched.iter_mut() {
                    sibling.stop(grace).await;
                }
                self.registry.add_many(launched).await;
                return Err(err);
            }
            self.registry.add_many(launched).await;
        }

        if self.registry.check_failures().await {
            return Err(JobError::Launch("a critical process exited right after launch".to_string()));
        }
        info!("Started {} worker processes", self.topology.processes.len());
        Ok(())
    }

    async fn start_worker(&self, process: &Process) -> Result<ManagedProcess> {
        info!(
            "Starting {} worker {} on {} (rank {}/{})",
            process.role, process.endpoint_index, process.node, process.node_rank, process.endpoint_nodes
        );

        let command = self.config.backend.build_worker_command(process, &self.ctx);
        let request = self
            .request(command, vec![process.node.clone()], &worker_log_file(process))
            .with_env(worker_environment(process, &self.config.backend, &self.ctx))
            .with_preamble(self.ctx.preamble.clone());
        self.spawn(process.name(), process.node.clone(), request, true).await
    }
}
