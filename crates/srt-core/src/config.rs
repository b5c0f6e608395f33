//! Job configuration
//!
//! A job file describes the model, the resource shape, the backend and frontend,
//! the benchmark to run and the supervision timeouts.

use crate::backend::BackendKind;
use crate::benchmark::BenchmarkKind;
use crate::frontend::FrontendConfig;
use crate::topology::ResourceRequest;
use crate::{Error, Result, WorkerRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration for one benchmark job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job name, used for the run directory and infra naming
    pub name: String,

    pub model: ModelConfig,

    pub resources: ResourcesConfig,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default)]
    pub frontend: FrontendConfig,

    #[serde(default)]
    pub benchmark: BenchmarkKind,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Environment applied to every worker
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Extra container mounts, `host` to `container` path
    #[serde(default)]
    pub extra_mounts: BTreeMap<String, String>,

    /// Script under `/configs` run before each worker starts
    #[serde(default)]
    pub setup_script: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Model and container selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Host path of the model weights, mounted at `/model`
    pub path: PathBuf,
    /// Container image
    pub container: String,
    /// Name served over the OpenAI API, defaults to the model directory name
    #[serde(default)]
    pub served_model_name: Option<String>,
}

/// Resource shape of the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub gpus_per_node: u32,
    #[serde(default)]
    pub prefill_workers: u32,
    #[serde(default)]
    pub decode_workers: u32,
    #[serde(default)]
    pub agg_workers: u32,
    #[serde(default)]
    pub prefill_nodes: Option<u32>,
    #[serde(default)]
    pub decode_nodes: Option<u32>,
    #[serde(default)]
    pub agg_nodes: Option<u32>,
    #[serde(default)]
    pub gpus_per_prefill: Option<u32>,
    #[serde(default)]
    pub gpus_per_decode: Option<u32>,
    #[serde(default)]
    pub gpus_per_agg: Option<u32>,
}

impl ResourcesConfig {
    /// GPUs per worker of a role, explicit or derived from its node count
    pub fn gpus_per_worker(&self, role: WorkerRole) -> Option<u32> {
        let (explicit, nodes, workers) = match role {
            WorkerRole::Prefill => (self.gpus_per_prefill, self.prefill_nodes, self.prefill_workers),
            WorkerRole::Decode => (self.gpus_per_decode, self.decode_nodes, self.decode_workers),
            WorkerRole::Aggregated => (self.gpus_per_agg, self.agg_nodes, self.agg_workers),
        };
        explicit.or_else(|| {
            let nodes = nodes?;
            if workers == 0 {
                return None;
            }
            Some(nodes * self.gpus_per_node / workers)
        })
    }

    pub fn is_disaggregated(&self) -> bool {
        self.prefill_workers > 0 || self.decode_workers > 0
    }

    pub fn total_workers(&self) -> u32 {
        self.prefill_workers + self.decode_workers + self.agg_workers
    }

    /// Short description, e.g. `2P + 4D` or `3 agg`
    pub fn describe(&self) -> String {
        if self.agg_workers > 0 {
            format!("{} agg", self.agg_workers)
        } else {
            format!("{}P + {}D", self.prefill_workers, self.decode_workers)
        }
    }

    /// Resolve into an allocator request.
    ///
    /// Roles whose GPU count cannot be derived are left at zero; the backend
    /// fills in its own default or rejects the request.
    pub fn to_request(&self) -> Result<ResourceRequest> {
        let request = ResourceRequest {
            gpus_per_node: self.gpus_per_node,
            prefill_workers: self.prefill_workers,
            decode_workers: self.decode_workers,
            agg_workers: self.agg_workers,
            gpus_per_prefill: self.gpus_per_worker(WorkerRole::Prefill).unwrap_or(0),
            gpus_per_decode: self.gpus_per_worker(WorkerRole::Decode).unwrap_or(0),
            gpus_per_agg: self.gpus_per_worker(WorkerRole::Aggregated).unwrap_or(0),
        };
        Ok(request)
    }
}

/// Readiness polling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_seconds: u64,
    pub max_attempts: u64,
    /// Minimum spacing of progress log lines
    pub report_every_seconds: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Readiness deadline, interval times attempts
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.saturating_mul(self.max_attempts))
    }

    pub fn report_every(&self) -> Duration {
        Duration::from_secs(self.report_every_seconds)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            max_attempts: 180,
            report_every_seconds: 60,
        }
    }
}

/// Head node coordination services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    /// Command starting NATS and etcd, a built-in script when unset
    pub command: Option<Vec<String>>,
    pub nats_port: u16,
    pub etcd_port: u16,
    /// Per-service wait for the ports to open
    pub timeout_seconds: u64,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            command: None,
            nats_port: 4222,
            etcd_port: 2379,
            timeout_seconds: 60,
        }
    }
}

/// Supervision intervals and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub monitor_interval_ms: u64,
    pub manual_poll_seconds: u64,
    pub benchmark_poll_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    pub terminate_grace_seconds: u64,
    /// Upper bound on the whole cleanup stage
    pub cleanup_timeout_seconds: u64,
    pub benchmark_timeout_seconds: Option<u64>,
}

impl SupervisorConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn manual_poll(&self) -> Duration {
        Duration::from_secs(self.manual_poll_seconds)
    }

    pub fn benchmark_poll(&self) -> Duration {
        Duration::from_millis(self.benchmark_poll_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_seconds)
    }

    pub fn benchmark_timeout(&self) -> Option<Duration> {
        self.benchmark_timeout_seconds.map(Duration::from_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 1000,
            manual_poll_seconds: 5,
            benchmark_poll_ms: 1000,
            terminate_grace_seconds: 10,
            cleanup_timeout_seconds: 30,
            benchmark_timeout_seconds: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,

    /// Log format (json, text)
    pub format: String,

    /// Include the target module in log lines
    pub show_target: bool,

    pub show_thread_ids: bool,

    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl JobConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: JobConfig = serde_yaml::from_str(&content)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| Error::config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Model name served to clients
    pub fn served_model_name(&self) -> String {
        self.model.served_model_name.clone().unwrap_or_else(|| {
            self.model
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.name.clone())
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Job name cannot be empty"));
        }
        if self.model.container.is_empty() {
            return Err(Error::config("model.container cannot be empty"));
        }

        let r = &self.resources;
        if r.gpus_per_node == 0 {
            return Err(Error::config("resources.gpus_per_node must be greater than 0"));
        }
        if r.is_disaggregated() && r.agg_workers > 0 {
            return Err(Error::config(
                "aggregated workers cannot be combined with prefill/decode workers",
            ));
        }
        if r.total_workers() == 0 {
            return Err(Error::config("at least one worker must be requested"));
        }
        if r.is_disaggregated() && (r.prefill_workers == 0 || r.decode_workers == 0) {
            return Err(Error::config(
                "disaggregated serving needs at least one prefill and one decode worker",
            ));
        }
        let request = r.to_request()?;
        self.backend.resolve_request(&request)?;

        let errors = self.benchmark.validate();
        if !errors.is_empty() {
            return Err(Error::config(errors.join("; ")));
        }

        if self.health_check.interval_seconds == 0 || self.health_check.max_attempts == 0 {
            return Err(Error::config("health_check interval and attempts must be greater than 0"));
        }
        if self.infra.timeout_seconds == 0 {
            return Err(Error::config("infra.timeout_seconds must be greater than 0"));
        }
        if self.supervisor.monitor_interval_ms == 0 || self.supervisor.benchmark_poll_ms == 0 {
            return Err(Error::config("supervisor poll intervals must be greater than 0"));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config(format!("Invalid log level: {}", self.logging.level))),
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => return Err(Error::config(format!("Invalid log format: {}", self.logging.format))),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DISAGG_YAML: &str = r#"
name: test-disagg
model:
  path: /models/Llama-3-8B
  container: sglang.sqsh
resources:
  gpus_per_node: 4
  prefill_nodes: 1
  decode_nodes: 2
  prefill_workers: 1
  decode_workers: 4
backend:
  type: sglang
  decode_environment:
    PYTHONUNBUFFERED: "1"
benchmark:
  type: sa-bench
  isl: 1024
  osl: 1024
  concurrencies: [16, 64]
"#;

    pub(crate) fn parse(yaml: &str) -> JobConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = parse(DISAGG_YAML);
        config.validate().unwrap();
        assert_eq!(config.health_check, HealthCheckConfig::default());
        assert_eq!(config.frontend.num_additional_frontends, 9);
        assert!(config.frontend.enable_multiple_frontends);
        assert_eq!(config.infra.nats_port, 4222);
        assert_eq!(config.supervisor.terminate_grace_seconds, 10);
        assert_eq!(config.served_model_name(), "Llama-3-8B");
        assert_eq!(config.health_check.timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_gpus_per_worker_derived_from_nodes() {
        let config = parse(DISAGG_YAML);
        let request = config.resources.to_request().unwrap();
        assert_eq!(request.gpus_per_prefill, 4);
        assert_eq!(request.gpus_per_decode, 2);
        assert_eq!(config.resources.describe(), "1P + 4D");
    }

    #[test]
    fn test_explicit_gpus_win() {
        let mut config = parse(DISAGG_YAML);
        config.resources.gpus_per_decode = Some(1);
        assert_eq!(config.resources.to_request().unwrap().gpus_per_decode, 1);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = parse(DISAGG_YAML);
        config.resources.agg_workers = 2;
        assert!(config.validate().is_err());

        let mut config = parse(DISAGG_YAML);
        config.resources.decode_nodes = None;
        assert!(config.validate().is_err());

        let mut config = parse(DISAGG_YAML);
        config.benchmark = BenchmarkKind::Custom { command: String::new() };
        assert!(config.validate().is_err());

        let mut config = parse(DISAGG_YAML);
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = parse(DISAGG_YAML);
        config.backend = BackendKind::Vllm(Default::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("job.yaml");

        let config = parse(DISAGG_YAML);
        config.to_file(&config_path).unwrap();
        let loaded = JobConfig::from_file(&config_path).unwrap();
        assert_eq!(config, loaded);

        assert!(JobConfig::from_file(temp_dir.path().join("missing.yaml")).is_err());
    }
}
