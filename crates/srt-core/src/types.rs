//! Common types used across srtctl

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Serving role of a worker endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    /// Prompt ingestion in a disaggregated deployment
    Prefill,
    /// Token generation in a disaggregated deployment
    Decode,
    /// Both phases in a single worker pool
    #[serde(rename = "agg", alias = "aggregated")]
    Aggregated,
}

impl WorkerRole {
    /// Allocation priority order
    pub const ALL: [WorkerRole; 3] = [WorkerRole::Prefill, WorkerRole::Decode, WorkerRole::Aggregated];

    /// Short name used in process names and log files
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Prefill => "prefill",
            WorkerRole::Decode => "decode",
            WorkerRole::Aggregated => "agg",
        }
    }

    /// Whether this role takes part in disaggregated serving
    pub fn is_disaggregated(&self) -> bool {
        !matches!(self, WorkerRole::Aggregated)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prefill" => Ok(WorkerRole::Prefill),
            "decode" => Ok(WorkerRole::Decode),
            "agg" | "aggregated" => Ok(WorkerRole::Aggregated),
            _ => Err(crate::Error::config(format!("Invalid worker role: {}", s))),
        }
    }
}

/// Convert a flag map into command line arguments.
///
/// `true` becomes a bare `--key`, `false` and null are dropped, lists expand to
/// `--key a b c`, and every other value is rendered as `--key value`.
/// Underscores in keys are written as hyphens.
pub fn args_to_flags(args: &BTreeMap<String, Value>) -> Vec<String> {
    let mut flags = Vec::new();
    for (key, value) in args {
        let flag = format!("--{}", key.trim_start_matches('-').replace('_', "-"));
        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => flags.push(flag),
            Value::String(s) => {
                flags.push(flag);
                flags.push(s.clone());
            }
            Value::Array(items) => {
                flags.push(flag);
                flags.extend(items.iter().map(scalar_to_string));
            }
            other => {
                flags.push(flag);
                flags.push(other.to_string());
            }
        }
    }
    flags
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
