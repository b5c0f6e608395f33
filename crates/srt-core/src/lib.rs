//! # srt-core
//!
//! Core types and pure planning logic for srtctl, a supervisor for
//! disaggregated LLM serving benchmarks on SLURM clusters.
//!
//! This crate provides the pieces that do not touch the operating system:
//!
//! - Resource allocation of logical endpoints onto a fixed node pool
//! - Materialization of endpoints into per-node processes with ports and GPU masks
//! - Job configuration schema, loading and validation
//! - Backend, frontend and benchmark variants with their command builders
//! - The explicit runtime context shared by every orchestration stage

pub mod backend;
pub mod benchmark;
pub mod config;
pub mod context;
pub mod error;
pub mod frontend;
pub mod topology;
pub mod types;

// Re-export commonly used types at the crate root
pub use backend::BackendKind;
pub use benchmark::BenchmarkKind;
pub use config::JobConfig;
pub use context::RuntimeContext;
pub use error::{Error, Result};
pub use frontend::{FrontendConfig, FrontendPlan, FrontendType};
pub use topology::{
    allocate_endpoints, endpoints_to_processes, Endpoint, PortLayout, Process, ResourceRequest,
    Topology,
};
pub use types::WorkerRole;
