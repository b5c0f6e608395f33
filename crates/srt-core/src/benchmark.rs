//! Benchmark variants
//!
//! Each variant validates its own settings and builds the command run on the
//! head node once the workers are ready. Bundled scripts live in the container
//! under [`BENCHMARK_SCRIPTS_DIR`].

use crate::context::RuntimeContext;
use serde::{Deserialize, Serialize};

/// Container directory holding bundled benchmark scripts
pub const BENCHMARK_SCRIPTS_DIR: &str = "/srtctl-benchmarks";

/// Benchmark selected by the `type` tag in the job file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BenchmarkKind {
    /// Keep the server up until interrupted
    #[default]
    Manual,
    /// Serving throughput sweep over concurrencies
    SaBench {
        #[serde(default)]
        isl: Option<u32>,
        #[serde(default)]
        osl: Option<u32>,
        #[serde(default)]
        concurrencies: Vec<u32>,
        #[serde(default)]
        req_rate: Option<String>,
    },
    Mmlu {
        #[serde(default = "default_mmlu_examples")]
        num_examples: u32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default = "default_threads")]
        num_threads: u32,
    },
    Gpqa {
        #[serde(default = "default_gpqa_examples")]
        num_examples: u32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default = "default_threads")]
        num_threads: u32,
    },
    /// Arbitrary shell command run in the container
    Custom { command: String },
}

fn default_mmlu_examples() -> u32 {
    200
}

fn default_gpqa_examples() -> u32 {
    198
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_repeat() -> u32 {
    8
}

fn default_threads() -> u32 {
    512
}

impl BenchmarkKind {
    /// Name used in logs and script paths
    pub fn name(&self) -> &'static str {
        match self {
            BenchmarkKind::Manual => "manual",
            BenchmarkKind::SaBench { .. } => "sa-bench",
            BenchmarkKind::Mmlu { .. } => "mmlu",
            BenchmarkKind::Gpqa { .. } => "gpqa",
            BenchmarkKind::Custom { .. } => "custom",
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, BenchmarkKind::Manual)
    }

    /// Script path inside the container, if the benchmark uses a bundled script
    pub fn script_path(&self) -> Option<String> {
        match self {
            BenchmarkKind::Manual | BenchmarkKind::Custom { .. } => None,
            other => Some(format!("{}/{}/bench.sh", BENCHMARK_SCRIPTS_DIR, other.name())),
        }
    }

    /// Collect every configuration problem, empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            BenchmarkKind::SaBench {
                isl,
                osl,
                concurrencies,
                ..
            } => {
                if isl.is_none() {
                    errors.push("sa-bench requires benchmark.isl".to_string());
                }
                if osl.is_none() {
                    errors.push("sa-bench requires benchmark.osl".to_string());
                }
                if concurrencies.is_empty() {
                    errors.push("sa-bench requires at least one entry in benchmark.concurrencies".to_string());
                }
                if concurrencies.contains(&0) {
                    errors.push("sa-bench concurrencies must be greater than zero".to_string());
                }
            }
            BenchmarkKind::Mmlu { num_examples, .. } | BenchmarkKind::Gpqa { num_examples, .. } => {
                if *num_examples == 0 {
                    errors.push(format!("{} requires benchmark.num_examples > 0", self.name()));
                }
            }
            BenchmarkKind::Custom { command } => {
                if command.trim().is_empty() {
                    errors.push("custom benchmark requires a non-empty benchmark.command".to_string());
                }
            }
            BenchmarkKind::Manual => {}
        }
        errors
    }

    /// Build the benchmark argv, `None` for manual mode
    pub fn build_command(&self, ctx: &RuntimeContext) -> Option<Vec<String>> {
        let endpoint = ctx.frontend_url();
        let script = self.script_path();
        let mut cmd = match (self, script) {
            (BenchmarkKind::Manual, _) => return None,
            (BenchmarkKind::Custom { command }, _) => {
                return Some(vec!["bash".to_string(), "-c".to_string(), command.clone()])
            }
            (_, Some(script)) => vec!["bash".to_string(), script, endpoint],
            (_, None) => return None,
        };

        match self {
            BenchmarkKind::SaBench {
                isl,
                osl,
                concurrencies,
                req_rate,
            } => {
                cmd.push(isl.unwrap_or_default().to_string());
                cmd.push(osl.unwrap_or_default().to_string());
                cmd.push(
                    concurrencies
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join("x"),
                );
                cmd.push(req_rate.clone().unwrap_or_else(|| "inf".to_string()));
                cmd.push(ctx.served_model_name.clone());
            }
            BenchmarkKind::Mmlu {
                num_examples,
                max_tokens,
                repeat,
                num_threads,
            }
            | BenchmarkKind::Gpqa {
                num_examples,
                max_tokens,
                repeat,
                num_threads,
            } => {
                cmd.push(num_examples.to_string());
                cmd.push(max_tokens.to_string());
                cmd.push(repeat.to_string());
                cmd.push(num_threads.to_string());
                cmd.push(ctx.served_model_name.clone());
            }
            BenchmarkKind::Manual | BenchmarkKind::Custom { .. } => {}
        }
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::frontend::FrontendType;

    #[test]
    fn test_benchmark_yaml_tags() {
        let bench: BenchmarkKind = serde_yaml::from_str("type: manual").unwrap();
        assert!(bench.is_manual());

        let bench: BenchmarkKind =
            serde_yaml::from_str("type: sa-bench\nisl: 1024\nosl: 128\nconcurrencies: [1, 8]\n").unwrap();
        assert_eq!(bench.name(), "sa-bench");
        assert!(bench.validate().is_empty());

        let bench: BenchmarkKind = serde_yaml::from_str("type: mmlu").unwrap();
        assert!(matches!(bench, BenchmarkKind::Mmlu { num_examples: 200, .. }));
    }

    #[test]
    fn test_sa_bench_validation_collects_all_errors() {
        let bench = BenchmarkKind::SaBench {
            isl: None,
            osl: None,
            concurrencies: vec![],
            req_rate: None,
        };
        assert_eq!(bench.validate().len(), 3);

        let bench = BenchmarkKind::Custom {
            command: "  ".to_string(),
        };
        assert_eq!(bench.validate().len(), 1);
    }

    #[test]
    fn test_sa_bench_command() {
        let ctx = test_context(FrontendType::Dynamo);
        let bench = BenchmarkKind::SaBench {
            isl: Some(1024),
            osl: Some(128),
            concurrencies: vec![1, 8, 64],
            req_rate: None,
        };
        let cmd = bench.build_command(&ctx).unwrap();
        assert_eq!(
            cmd,
            vec![
                "bash",
                "/srtctl-benchmarks/sa-bench/bench.sh",
                "http://node0:8000",
                "1024",
                "128",
                "1x8x64",
                "inf",
                "test-model",
            ]
        );
    }

    #[test]
    fn test_manual_and_custom_commands() {
        let ctx = test_context(FrontendType::Dynamo);
        assert!(BenchmarkKind::Manual.build_command(&ctx).is_none());
        assert!(BenchmarkKind::Manual.script_path().is_none());

        let bench = BenchmarkKind::Custom {
            command: "exit 3".to_string(),
        };
        assert_eq!(bench.build_command(&ctx).unwrap(), vec!["bash", "-c", "exit 3"]);
    }
}
