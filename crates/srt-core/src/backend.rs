//! Serving backends
//!
//! A closed set of backend variants, each carrying its own configuration
//! payload and dispatched through [`BackendKind`].

use crate::context::RuntimeContext;
use crate::frontend::FrontendType;
use crate::topology::{allocate_endpoints, Endpoint, Process, ResourceRequest};
use crate::types::args_to_flags;
use crate::{Error, Result, WorkerRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-role engine flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleFlags {
    pub prefill: BTreeMap<String, Value>,
    pub decode: BTreeMap<String, Value>,
    pub aggregated: BTreeMap<String, Value>,
}

impl RoleFlags {
    pub fn for_role(&self, role: WorkerRole) -> &BTreeMap<String, Value> {
        match role {
            WorkerRole::Prefill => &self.prefill,
            WorkerRole::Decode => &self.decode,
            WorkerRole::Aggregated => &self.aggregated,
        }
    }
}

/// Per-role environment lookup shared by the disaggregation-capable backends
fn role_environment(
    role: WorkerRole,
    prefill: &BTreeMap<String, String>,
    decode: &BTreeMap<String, String>,
    aggregated: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    match role {
        WorkerRole::Prefill => prefill.clone(),
        WorkerRole::Decode => decode.clone(),
        WorkerRole::Aggregated => aggregated.clone(),
    }
}

/// SGLang engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SglangConfig {
    #[serde(default)]
    pub prefill_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub decode_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregated_environment: BTreeMap<String, String>,
    /// Engine flags per role, passed through as `--flag value`
    #[serde(default)]
    pub sglang_config: RoleFlags,
    /// Publish KV cache events on the process event port (dynamo frontend only)
    #[serde(default = "default_true")]
    pub kv_events: bool,
}

impl Default for SglangConfig {
    fn default() -> Self {
        Self {
            prefill_environment: BTreeMap::new(),
            decode_environment: BTreeMap::new(),
            aggregated_environment: BTreeMap::new(),
            sglang_config: RoleFlags::default(),
            kv_events: true,
        }
    }
}

/// TensorRT-LLM engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrtllmConfig {
    #[serde(default)]
    pub engine_path: Option<String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u32,
    #[serde(default = "default_max_len")]
    pub max_input_len: u32,
    #[serde(default = "default_max_len")]
    pub max_output_len: u32,
    #[serde(default)]
    pub prefill_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub decode_environment: BTreeMap<String, String>,
    #[serde(default)]
    pub aggregated_environment: BTreeMap<String, String>,
}

impl Default for TrtllmConfig {
    fn default() -> Self {
        Self {
            engine_path: None,
            max_batch_size: default_max_batch_size(),
            max_input_len: default_max_len(),
            max_output_len: default_max_len(),
            prefill_environment: BTreeMap::new(),
            decode_environment: BTreeMap::new(),
            aggregated_environment: BTreeMap::new(),
        }
    }
}

/// vLLM engine settings, aggregated serving only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VllmConfig {
    #[serde(default = "default_one")]
    pub tensor_parallel_size: u32,
    #[serde(default = "default_one")]
    pub pipeline_parallel_size: u32,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            max_model_len: None,
            gpu_memory_utilization: default_gpu_memory_utilization(),
            environment: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

fn default_max_batch_size() -> u32 {
    64
}

fn default_max_len() -> u32 {
    2048
}

fn default_gpu_memory_utilization() -> f64 {
    0.9
}

/// Serving backend selected by the `type` tag in the job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendKind {
    Sglang(SglangConfig),
    Trtllm(TrtllmConfig),
    Vllm(VllmConfig),
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Sglang(SglangConfig::default())
    }
}

impl BackendKind {
    /// Backend name for logging
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sglang(_) => "sglang",
            BackendKind::Trtllm(_) => "trtllm",
            BackendKind::Vllm(_) => "vllm",
        }
    }

    /// Check backend-specific constraints on the resource request
    pub fn validate(&self, request: &ResourceRequest) -> Result<()> {
        if let BackendKind::Vllm(cfg) = self {
            if request.prefill_workers > 0 || request.decode_workers > 0 {
                return Err(Error::config(
                    "vllm backend only supports aggregated workers",
                ));
            }
            if cfg.tensor_parallel_size == 0 || cfg.pipeline_parallel_size == 0 {
                return Err(Error::config("vllm parallel sizes must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Fill backend defaults into a request and check every role has GPUs.
    ///
    /// vLLM falls back to its parallelism product when no GPU count is given
    /// for aggregated workers.
    pub fn resolve_request(&self, request: &ResourceRequest) -> Result<ResourceRequest> {
        self.validate(request)?;
        let mut resolved = request.clone();
        if let BackendKind::Vllm(cfg) = self {
            if resolved.gpus_per_agg == 0 {
                resolved.gpus_per_agg = cfg.tensor_parallel_size * cfg.pipeline_parallel_size;
            }
        }
        for role in WorkerRole::ALL {
            let (count, need) = resolved.demand(role);
            if count > 0 && need == 0 {
                return Err(Error::config(format!(
                    "cannot determine GPUs per {} worker: set gpus_per_{} or {}_nodes",
                    role, role, role
                )));
            }
        }
        Ok(resolved)
    }

    /// Place endpoints for this backend
    pub fn allocate_endpoints(&self, request: &ResourceRequest, nodes: &[String]) -> Result<Vec<Endpoint>> {
        let resolved = self.resolve_request(request)?;
        allocate_endpoints(&resolved, nodes)
    }

    /// Environment variables contributed by the backend for a role
    pub fn environment_for_role(&self, role: WorkerRole) -> BTreeMap<String, String> {
        match self {
            BackendKind::Sglang(cfg) => role_environment(
                role,
                &cfg.prefill_environment,
                &cfg.decode_environment,
                &cfg.aggregated_environment,
            ),
            BackendKind::Trtllm(cfg) => role_environment(
                role,
                &cfg.prefill_environment,
                &cfg.decode_environment,
                &cfg.aggregated_environment,
            ),
            BackendKind::Vllm(cfg) => cfg.environment.clone(),
        }
    }

    /// Build the worker command line for one process
    pub fn build_worker_command(&self, process: &Process, ctx: &RuntimeContext) -> Vec<String> {
        match self {
            BackendKind::Sglang(cfg) => sglang_command(cfg, process, ctx),
            BackendKind::Trtllm(cfg) => trtllm_command(cfg, process, ctx),
            BackendKind::Vllm(cfg) => vllm_command(cfg, process, ctx),
        }
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn push_flag(cmd: &mut Vec<String>, flag: &str, value: impl ToString) {
    cmd.push(flag.to_string());
    cmd.push(value.to_string());
}

fn push_multi_node(cmd: &mut Vec<String>, process: &Process) {
    if let Some(port) = process.dist_init_port {
        push_flag(cmd, "--dist-init-addr", format!("{}:{}", process.leader_node, port));
        push_flag(cmd, "--nnodes", process.endpoint_nodes);
        push_flag(cmd, "--node-rank", process.node_rank);
    }
}

fn tensor_parallel_size(process: &Process) -> u32 {
    process.gpu_indices.len() as u32 * process.endpoint_nodes
}

fn sglang_command(cfg: &SglangConfig, process: &Process, ctx: &RuntimeContext) -> Vec<String> {
    let module = match ctx.frontend_type {
        FrontendType::Dynamo => "dynamo.sglang",
        FrontendType::Sglang => "sglang.launch_server",
    };
    let mut cmd = strings(&["python3", "-m", module]);
    push_flag(&mut cmd, "--model-path", &ctx.container_model_path);
    push_flag(&mut cmd, "--served-model-name", &ctx.served_model_name);
    push_flag(&mut cmd, "--host", "0.0.0.0");

    if ctx.frontend_type == FrontendType::Sglang {
        if let Some(port) = process.http_port {
            push_flag(&mut cmd, "--port", port);
        }
    }

    if process.role.is_disaggregated() {
        push_flag(&mut cmd, "--disaggregation-mode", process.role);
        if let Some(port) = process.bootstrap_port {
            push_flag(&mut cmd, "--disaggregation-bootstrap-port", port);
        }
    }

    let flags = cfg.sglang_config.for_role(process.role);
    if !flags.contains_key("tp-size") && !flags.contains_key("tensor-parallel-size") {
        push_flag(&mut cmd, "--tp-size", tensor_parallel_size(process));
    }
    push_multi_node(&mut cmd, process);

    if cfg.kv_events && ctx.frontend_type == FrontendType::Dynamo {
        let events = serde_json::json!({
            "publisher": "zmq",
            "topic": "kv-events",
            "endpoint": format!("tcp://*:{}", process.event_port),
        });
        push_flag(&mut cmd, "--kv-events-config", events);
    }

    cmd.extend(args_to_flags(flags));
    cmd
}

fn trtllm_command(cfg: &TrtllmConfig, process: &Process, ctx: &RuntimeContext) -> Vec<String> {
    let mut cmd = strings(&["python3", "-m", "dynamo.trtllm"]);
    push_flag(&mut cmd, "--model-path", &ctx.container_model_path);
    push_flag(&mut cmd, "--served-model-name", &ctx.served_model_name);
    push_flag(&mut cmd, "--host", "0.0.0.0");
    if process.role.is_disaggregated() {
        push_flag(&mut cmd, "--disaggregation-mode", process.role);
    }
    if let Some(engine) = &cfg.engine_path {
        push_flag(&mut cmd, "--engine-path", engine);
    }
    push_flag(&mut cmd, "--max-batch-size", cfg.max_batch_size);
    push_flag(&mut cmd, "--max-input-len", cfg.max_input_len);
    push_flag(&mut cmd, "--max-output-len", cfg.max_output_len);
    push_multi_node(&mut cmd, process);
    cmd
}

fn vllm_command(cfg: &VllmConfig, process: &Process, ctx: &RuntimeContext) -> Vec<String> {
    let mut cmd = strings(&["python3", "-m", "dynamo.vllm"]);
    push_flag(&mut cmd, "--model", &ctx.container_model_path);
    push_flag(&mut cmd, "--served-model-name", &ctx.served_model_name);
    push_flag(&mut cmd, "--host", "0.0.0.0");
    if let Some(port) = process.http_port {
        push_flag(&mut cmd, "--port", port);
    }
    push_flag(&mut cmd, "--tensor-parallel-size", cfg.tensor_parallel_size);
    push_flag(&mut cmd, "--pipeline-parallel-size", cfg.pipeline_parallel_size);
    push_flag(&mut cmd, "--gpu-memory-utilization", cfg.gpu_memory_utilization);
    if let Some(len) = cfg.max_model_len {
        push_flag(&mut cmd, "--max-model-len", len);
    }
    cmd
}
