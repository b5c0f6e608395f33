//! Runtime context
//!
//! Everything the stages need about the current allocation, resolved once at
//! startup and passed by reference. Nothing downstream reads the process
//! environment directly.

use crate::config::JobConfig;
use crate::frontend::{FrontendType, PUBLIC_PORT};
use crate::topology::PortLayout;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Container path the model weights are mounted at
pub const CONTAINER_MODEL_PATH: &str = "/model";
/// Container path the log directory is mounted at
pub const CONTAINER_LOG_PATH: &str = "/logs";

/// Resolved job environment shared by all stages
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContext {
    pub job_id: String,
    pub run_name: String,
    /// Allocated nodes, head first
    pub nodes: Vec<String>,
    /// Address workers use to reach the head node
    pub head_node_ip: String,
    pub log_dir: PathBuf,
    pub container_image: String,
    /// Host path to container path
    pub container_mounts: BTreeMap<String, String>,
    pub container_model_path: String,
    pub gpus_per_node: u32,
    pub served_model_name: String,
    pub frontend_type: FrontendType,
    pub frontend_port: u16,
    pub ports: PortLayout,
    pub nats_port: u16,
    pub etcd_port: u16,
    /// Environment applied to every worker
    pub environment: BTreeMap<String, String>,
    /// Bash run before worker and frontend commands
    pub preamble: Option<String>,
}

impl RuntimeContext {
    /// Build the context from a validated config and an allocation
    pub fn new(config: &JobConfig, job_id: impl Into<String>, nodes: Vec<String>, log_dir: PathBuf) -> Result<Self> {
        let head = nodes
            .first()
            .cloned()
            .ok_or_else(|| Error::config("job has no nodes"))?;
        let job_id = job_id.into();

        let mut container_mounts = BTreeMap::new();
        container_mounts.insert(
            config.model.path.to_string_lossy().into_owned(),
            CONTAINER_MODEL_PATH.to_string(),
        );
        container_mounts.insert(
            log_dir.to_string_lossy().into_owned(),
            CONTAINER_LOG_PATH.to_string(),
        );
        container_mounts.extend(config.extra_mounts.clone());

        Ok(Self {
            run_name: format!("{}_{}", config.name, job_id),
            job_id,
            nodes,
            head_node_ip: head,
            log_dir,
            container_image: config.model.container.clone(),
            container_mounts,
            container_model_path: CONTAINER_MODEL_PATH.to_string(),
            gpus_per_node: config.resources.gpus_per_node,
            served_model_name: config.served_model_name(),
            frontend_type: config.frontend.frontend_type,
            frontend_port: PUBLIC_PORT,
            ports: PortLayout::default(),
            nats_port: config.infra.nats_port,
            etcd_port: config.infra.etcd_port,
            environment: config.environment.clone(),
            preamble: build_preamble(config),
        })
    }

    /// Override the address workers use for the head node
    pub fn with_head_ip(mut self, ip: impl Into<String>) -> Self {
        self.head_node_ip = ip.into();
        self
    }

    pub fn head_node(&self) -> &str {
        self.nodes.first().map(String::as_str).unwrap_or(&self.head_node_ip)
    }

    pub fn nats_server(&self) -> String {
        format!("nats://{}:{}", self.head_node_ip, self.nats_port)
    }

    pub fn etcd_endpoints(&self) -> String {
        format!("http://{}:{}", self.head_node_ip, self.etcd_port)
    }

    /// URL clients and benchmarks use
    pub fn frontend_url(&self) -> String {
        format!("http://{}:{}", self.head_node(), self.frontend_port)
    }

    /// Host path of a file in the log directory
    pub fn log_path(&self, file: &str) -> PathBuf {
        self.log_dir.join(file)
    }

    /// Container path of a file in the log directory
    pub fn container_log_path(&self, file: &str) -> String {
        Path::new(CONTAINER_LOG_PATH).join(file).to_string_lossy().into_owned()
    }

    /// Mounts rendered as `host:container` pairs
    pub fn mount_spec(&self) -> String {
        self.container_mounts
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn build_preamble(config: &JobConfig) -> Option<String> {
    let mut parts = Vec::new();

    if let Some(script) = &config.setup_script {
        let path = format!("/configs/{}", script);
        parts.push(format!(
            "echo 'Running setup script: {path}' && if [ -f '{path}' ]; then bash '{path}'; else echo 'WARNING: {path} not found'; fi",
            path = path
        ));
    }

    if config.frontend.frontend_type == FrontendType::Dynamo {
        if let Some(packages) = &config.frontend.dynamo_install {
            parts.push(format!(
                "echo 'Installing dynamo...' && pip install --quiet {} && echo 'Dynamo installed'",
                packages
            ));
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" && "))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::JobConfig;

    pub(crate) fn test_config(frontend: FrontendType) -> JobConfig {
        let yaml = format!(
            r#"
name: test
model:
  path: /models/test-model
  container: test.sqsh
resources:
  gpus_per_node: 4
  prefill_workers: 1
  decode_workers: 1
  gpus_per_prefill: 4
  gpus_per_decode: 4
frontend:
  type: {}
"#,
            frontend
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    pub(crate) fn test_context(frontend: FrontendType) -> RuntimeContext {
        let nodes = (0..4).map(|i| format!("node{}", i)).collect();
        RuntimeContext::new(&test_config(frontend), "1234", nodes, PathBuf::from("/tmp/logs")).unwrap()
    }

    #[test]
    fn test_context_from_config() {
        let ctx = test_context(FrontendType::Dynamo);
        assert_eq!(ctx.run_name, "test_1234");
        assert_eq!(ctx.head_node(), "node0");
        assert_eq!(ctx.served_model_name, "test-model");
        assert_eq!(ctx.nats_server(), "nats://node0:4222");
        assert_eq!(ctx.etcd_endpoints(), "http://node0:2379");
        assert_eq!(ctx.frontend_url(), "http://node0:8000");
        assert_eq!(ctx.ports.sys_base, 8081);
        assert_eq!(ctx.log_path("benchmark.out"), PathBuf::from("/tmp/logs/benchmark.out"));
        assert_eq!(ctx.container_log_path("nginx.conf"), "/logs/nginx.conf");
        assert!(ctx.mount_spec().contains("/models/test-model:/model"));
        assert!(ctx.preamble.as_deref().unwrap().contains("pip install"));
    }

    #[test]
    fn test_router_context_skips_dynamo_install() {
        let ctx = test_context(FrontendType::Sglang);
        assert!(ctx.preamble.is_none());

        let ctx = ctx.with_head_ip("10.0.0.1");
        assert_eq!(ctx.nats_server(), "nats://10.0.0.1:4222");
        assert_eq!(ctx.frontend_url(), "http://node0:8000");
    }

    #[test]
    fn test_context_requires_nodes() {
        let config = test_config(FrontendType::Dynamo);
        assert!(RuntimeContext::new(&config, "1", Vec::new(), PathBuf::from("/tmp")).is_err());
    }
}
