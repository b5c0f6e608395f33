//! Frontend placement and command construction
//!
//! The frontend sits between clients and the worker pools. A `dynamo` frontend
//! discovers workers through the registry, an `sglang` router is handed the
//! worker leaders directly. With more than one node, several frontends run
//! behind an nginx load balancer on the head node.

use crate::context::RuntimeContext;
use crate::topology::Topology;
use crate::types::args_to_flags;
use crate::{Error, WorkerRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Public port clients connect to
pub const PUBLIC_PORT: u16 = 8000;
/// Port frontends listen on when nginx fronts them
pub const INTERNAL_FRONTEND_PORT: u16 = 8080;
/// Fixed registry name of the load balancer process
pub const NGINX_PROCESS_NAME: &str = "nginx";

/// Kind of frontend in front of the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendType {
    /// Registry-routed frontend, workers self-register over etcd/NATS
    Dynamo,
    /// Router addressing worker leaders directly
    Sglang,
}

impl FrontendType {
    /// Readiness endpoint exposed by this frontend
    pub fn health_path(&self) -> &'static str {
        match self {
            FrontendType::Dynamo => "/health",
            FrontendType::Sglang => "/workers",
        }
    }

    /// Prefix of frontend process names
    pub fn process_prefix(&self) -> &'static str {
        match self {
            FrontendType::Dynamo => "frontend",
            FrontendType::Sglang => "sglang_router",
        }
    }

    /// Prefix of frontend log files
    fn log_prefix(&self) -> &'static str {
        match self {
            FrontendType::Dynamo => "frontend",
            FrontendType::Sglang => "router",
        }
    }
}

impl fmt::Display for FrontendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrontendType::Dynamo => write!(f, "dynamo"),
            FrontendType::Sglang => write!(f, "sglang"),
        }
    }
}

impl FromStr for FrontendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dynamo" => Ok(FrontendType::Dynamo),
            "sglang" => Ok(FrontendType::Sglang),
            _ => Err(Error::config(format!(
                "Unknown frontend type: {}. Supported: dynamo, sglang",
                s
            ))),
        }
    }
}

/// Frontend section of the job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(rename = "type", default = "default_frontend_type")]
    pub frontend_type: FrontendType,
    #[serde(default = "default_true")]
    pub enable_multiple_frontends: bool,
    /// Frontends beyond the first, capped by available nodes
    #[serde(default = "default_additional_frontends")]
    pub num_additional_frontends: u32,
    /// Extra frontend flags
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Packages installed before dynamo processes start, `None` to skip
    #[serde(default = "default_dynamo_install")]
    pub dynamo_install: Option<String>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            frontend_type: default_frontend_type(),
            enable_multiple_frontends: true,
            num_additional_frontends: default_additional_frontends(),
            args: BTreeMap::new(),
            env: BTreeMap::new(),
            dynamo_install: default_dynamo_install(),
        }
    }
}

fn default_frontend_type() -> FrontendType {
    FrontendType::Dynamo
}

fn default_true() -> bool {
    true
}

fn default_additional_frontends() -> u32 {
    9
}

fn default_dynamo_install() -> Option<String> {
    Some("ai-dynamo-runtime==0.7.0 ai-dynamo==0.7.0".to_string())
}

/// Where the load balancer and frontends run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendPlan {
    pub nginx_node: Option<String>,
    pub frontend_nodes: Vec<String>,
    /// Port each frontend listens on
    pub frontend_port: u16,
    /// Port clients use, nginx or the single frontend
    pub public_port: u16,
}

impl FrontendPlan {
    /// Decide placement from the node list, head first.
    ///
    /// A single node or disabled multi-frontend mode gives one frontend on the
    /// head. Otherwise nginx takes the head and frontends run on the remaining
    /// nodes, at most `num_additional_frontends + 1` of them.
    pub fn compute(config: &FrontendConfig, nodes: &[String]) -> Result<Self, Error> {
        let head = nodes
            .first()
            .ok_or_else(|| Error::config("no nodes available for frontends"))?;

        if nodes.len() == 1 || !config.enable_multiple_frontends {
            return Ok(Self {
                nginx_node: None,
                frontend_nodes: vec![head.clone()],
                frontend_port: PUBLIC_PORT,
                public_port: PUBLIC_PORT,
            });
        }

        let others = &nodes[1..];
        let count = others.len().min(config.num_additional_frontends as usize + 1);
        let frontend_nodes = others[..count].to_vec();
        info!(
            "Frontend topology: nginx on {}, {} frontends on {}",
            head,
            frontend_nodes.len(),
            frontend_nodes.join(", ")
        );
        Ok(Self {
            nginx_node: Some(head.clone()),
            frontend_nodes,
            frontend_port: INTERNAL_FRONTEND_PORT,
            public_port: PUBLIC_PORT,
        })
    }

    pub fn uses_nginx(&self) -> bool {
        self.nginx_node.is_some()
    }

    /// Render the nginx configuration balancing across the frontends
    pub fn render_nginx_config(&self) -> String {
        let upstreams: String = self
            .frontend_nodes
            .iter()
            .map(|host| format!("        server {}:{};\n", host, self.frontend_port))
            .collect();

        format!(
            r#"worker_processes auto;
error_log /dev/stderr warn;
pid /tmp/nginx.pid;

events {{
    worker_connections 65536;
}}

http {{
    access_log off;
    client_max_body_size 0;
    proxy_read_timeout 3600s;
    proxy_send_timeout 3600s;

    upstream frontends {{
        least_conn;
{upstreams}        keepalive 1024;
    }}

    server {{
        listen {listen};

        location / {{
            proxy_pass http://frontends;
            proxy_http_version 1.1;
            proxy_set_header Connection "";
            proxy_buffering off;
        }}
    }}
}}
"#,
            upstreams = upstreams,
            listen = self.public_port,
        )
    }
}

/// One frontend process to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendLaunch {
    pub name: String,
    pub node: String,
    pub log_file: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Build launches for every frontend in the plan
pub fn frontend_launches(
    config: &FrontendConfig,
    plan: &FrontendPlan,
    topology: &Topology,
    ctx: &RuntimeContext,
) -> Vec<FrontendLaunch> {
    let ty = config.frontend_type;
    plan.frontend_nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| {
            let mut command = match ty {
                FrontendType::Dynamo => dynamo_command(plan.frontend_port),
                FrontendType::Sglang => router_command(topology, plan.frontend_port),
            };
            command.extend(args_to_flags(&config.args));

            let mut env = BTreeMap::new();
            if ty == FrontendType::Dynamo {
                env.insert("ETCD_ENDPOINTS".to_string(), ctx.etcd_endpoints());
                env.insert("NATS_SERVER".to_string(), ctx.nats_server());
            }
            env.extend(config.env.clone());

            FrontendLaunch {
                name: format!("{}_{}", ty.process_prefix(), idx),
                node: node.clone(),
                log_file: format!("{}_{}_{}.out", node, ty.log_prefix(), idx),
                command,
                env,
            }
        })
        .collect()
}

fn dynamo_command(port: u16) -> Vec<String> {
    vec![
        "python3".to_string(),
        "-m".to_string(),
        "dynamo.frontend".to_string(),
        format!("--http-port={}", port),
    ]
}

fn router_command(topology: &Topology, port: u16) -> Vec<String> {
    let mut cmd: Vec<String> = ["python", "-m", "sglang_router.launch_router"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let disaggregated = topology.endpoints.iter().any(|e| e.role.is_disaggregated());
    if disaggregated {
        cmd.push("--pd-disaggregation".to_string());
        for leader in topology.leaders(WorkerRole::Prefill) {
            if let Some(http) = leader.http_port {
                cmd.push("--prefill".to_string());
                cmd.push(format!("http://{}:{}", leader.node, http));
                if let Some(bootstrap) = leader.bootstrap_port {
                    cmd.push(bootstrap.to_string());
                }
            }
        }
        for leader in topology.leaders(WorkerRole::Decode) {
            if let Some(http) = leader.http_port {
                cmd.push("--decode".to_string());
                cmd.push(format!("http://{}:{}", leader.node, http));
            }
        }
    } else {
        cmd.push("--worker-urls".to_string());
        for leader in topology.leaders(WorkerRole::Aggregated) {
            if let Some(http) = leader.http_port {
                cmd.push(format!("http://{}:{}", leader.node, http));
            }
        }
    }

    cmd.extend([
        "--host".to_string(),
        "0.0.0.0".to_string(),
        "--port".to_string(),
        port.to_string(),
    ]);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::topology::{PortLayout, ResourceRequest};

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node{}", i)).collect()
    }

    fn topology(p: u32, d: u32, a: u32) -> Topology {
        let req = ResourceRequest {
            gpus_per_node: 4,
            prefill_workers: p,
            decode_workers: d,
            agg_workers: a,
            gpus_per_prefill: 4,
            gpus_per_decode: 4,
            gpus_per_agg: 4,
        };
        Topology::plan(&req, &nodes(4), &PortLayout::default()).unwrap()
    }

    #[test]
    fn test_single_node_plan() {
        let plan = FrontendPlan::compute(&FrontendConfig::default(), &nodes(1)).unwrap();
        assert!(!plan.uses_nginx());
        assert_eq!(plan.frontend_nodes, vec!["node0"]);
        assert_eq!(plan.frontend_port, 8000);
    }

    #[test]
    fn test_multiple_frontends_disabled() {
        let config = FrontendConfig {
            enable_multiple_frontends: false,
            ..FrontendConfig::default()
        };
        let plan = FrontendPlan::compute(&config, &nodes(4)).unwrap();
        assert!(!plan.uses_nginx());
        assert_eq!(plan.frontend_nodes, vec!["node0"]);
        assert_eq!(plan.public_port, 8000);
    }

    #[test]
    fn test_nginx_plan_caps_frontends() {
        let config = FrontendConfig {
            num_additional_frontends: 1,
            ..FrontendConfig::default()
        };
        let plan = FrontendPlan::compute(&config, &nodes(5)).unwrap();
        assert_eq!(plan.nginx_node.as_deref(), Some("node0"));
        assert_eq!(plan.frontend_nodes, vec!["node1", "node2"]);
        assert_eq!(plan.frontend_port, 8080);
        assert_eq!(plan.public_port, 8000);

        let plan = FrontendPlan::compute(&FrontendConfig::default(), &nodes(3)).unwrap();
        assert_eq!(plan.frontend_nodes, vec!["node1", "node2"]);
    }

    #[test]
    fn test_empty_node_list() {
        assert!(FrontendPlan::compute(&FrontendConfig::default(), &[]).is_err());
    }

    #[test]
    fn test_nginx_config() {
        let plan = FrontendPlan::compute(&FrontendConfig::default(), &nodes(3)).unwrap();
        let conf = plan.render_nginx_config();
        assert!(conf.contains("server node1:8080;"));
        assert!(conf.contains("server node2:8080;"));
        assert!(conf.contains("listen 8000;"));
    }

    #[test]
    fn test_dynamo_frontend_launches() {
        let mut config = FrontendConfig::default();
        config.args.insert("router-mode".to_string(), Value::String("kv".to_string()));
        let plan = FrontendPlan::compute(&config, &nodes(3)).unwrap();
        let ctx = test_context(FrontendType::Dynamo);
        let launches = frontend_launches(&config, &plan, &topology(1, 1, 0), &ctx);

        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].name, "frontend_0");
        assert_eq!(launches[0].log_file, "node1_frontend_0.out");
        assert_eq!(
            launches[0].command,
            vec!["python3", "-m", "dynamo.frontend", "--http-port=8080", "--router-mode", "kv"]
        );
        assert_eq!(launches[1].name, "frontend_1");
        assert!(launches[0].env.contains_key("ETCD_ENDPOINTS"));
        assert!(launches[0].env.contains_key("NATS_SERVER"));
    }

    #[test]
    fn test_router_disaggregated_command() {
        let config = FrontendConfig {
            frontend_type: FrontendType::Sglang,
            enable_multiple_frontends: false,
            ..FrontendConfig::default()
        };
        let plan = FrontendPlan::compute(&config, &nodes(2)).unwrap();
        let ctx = test_context(FrontendType::Sglang);
        let launches = frontend_launches(&config, &plan, &topology(1, 1, 0), &ctx);

        assert_eq!(launches[0].name, "sglang_router_0");
        assert_eq!(launches[0].log_file, "node0_router_0.out");
        let cmd = launches[0].command.join(" ");
        assert!(cmd.starts_with("python -m sglang_router.launch_router --pd-disaggregation"));
        assert!(cmd.contains("--prefill http://node0:30000 31000"));
        assert!(cmd.contains("--decode http://node1:30001"));
        assert!(cmd.ends_with("--host 0.0.0.0 --port 8000"));
        assert!(!launches[0].env.contains_key("ETCD_ENDPOINTS"));
    }

    #[test]
    fn test_router_aggregated_command() {
        let config = FrontendConfig {
            frontend_type: FrontendType::Sglang,
            enable_multiple_frontends: false,
            ..FrontendConfig::default()
        };
        let plan = FrontendPlan::compute(&config, &nodes(2)).unwrap();
        let ctx = test_context(FrontendType::Sglang);
        let launches = frontend_launches(&config, &plan, &topology(0, 0, 2), &ctx);
        let cmd = launches[0].command.join(" ");
        assert!(cmd.contains("--worker-urls http://node0:30000 http://node1:30001"));
        assert!(!cmd.contains("--pd-disaggregation"));
    }

    #[test]
    fn test_frontend_type_parsing() {
        assert_eq!("dynamo".parse::<FrontendType>().unwrap(), FrontendType::Dynamo);
        assert_eq!("SGLang".parse::<FrontendType>().unwrap(), FrontendType::Sglang);
        assert!("envoy".parse::<FrontendType>().is_err());
        assert_eq!(FrontendType::Sglang.health_path(), "/workers");
        assert_eq!(FrontendType::Dynamo.health_path(), "/health");
    }
}
