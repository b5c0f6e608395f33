//! Head node infrastructure: the NATS bus and the etcd discovery service

use crate::{JobError, Orchestrator, Result};
use srt_core::{JobConfig, RuntimeContext};
use srt_runtime::health::wait_for_port;
use srt_runtime::RuntimeError;
use std::time::Duration;
use tracing::info;

pub const INFRA_PROCESS_NAME: &str = "head_infrastructure";
pub const INFRA_LOG: &str = "log.out";

/// Command starting NATS and etcd in the foreground
pub fn infra_command(config: &JobConfig, ctx: &RuntimeContext) -> Vec<String> {
    if let Some(command) = &config.infra.command {
        return command.clone();
    }

    let script = format!(
        "nats-server -js -p {nats} & \
         etcd --listen-client-urls http://0.0.0.0:{etcd} \
         --advertise-client-urls http://{head}:{etcd} \
         --data-dir /tmp/etcd & \
         wait",
        nats = ctx.nats_port,
        etcd = ctx.etcd_port,
        head = ctx.head_node_ip,
    );
    vec!["bash".to_string(), "-c".to_string(), script]
}

impl Orchestrator {
    /// Start NATS and etcd on the head node and wait for both ports
    pub(crate) async fn start_head_infrastructure(&self) -> Result<()> {
        let head = self.ctx.head_node().to_string();
        info!("Starting head node infrastructure on {}", head);

        let mut request = self.request(infra_command(&self.config, &self.ctx), vec![head.clone()], INFRA_LOG);
        request.wrap_in_bash = false;
        let process = self.spawn(INFRA_PROCESS_NAME, head, request, true).await?;
        self.registry.add(process).await;

        let limit = Duration::from_secs(self.config.infra.timeout_seconds);
        for (service, port) in [("NATS", self.ctx.nats_port), ("etcd", self.ctx.etcd_port)] {
            info!("Waiting for {} (port {})...", service, port);
            match wait_for_port(&self.ctx.head_node_ip, port, limit, &self.cancel).await {
                Ok(()) => info!("{} is ready", service),
                Err(RuntimeError::Cancelled(_)) => {
                    return Err(self.cancellation_error("starting head infrastructure").await);
                }
                Err(other) => {
                    return Err(JobError::Infrastructure(format!(
                        "{} failed to start: {}",
                        service, other
                    )));
                }
            }
        }
        Ok(())
    }
}
