//! Stage implementations
//!
//! Each module adds the methods for one orchestration stage to
//! [`Orchestrator`](crate::Orchestrator) and holds the command builders that
//! stage needs.

pub mod benchmark;
pub mod frontend;
pub mod infra;
pub mod workers;

pub use benchmark::{BENCHMARK_LOG, BENCHMARK_PROCESS_NAME};
pub use frontend::{connection_commands, nginx_command, NGINX_CONFIG_FILE};
pub use infra::{infra_command, INFRA_LOG, INFRA_PROCESS_NAME};
pub use workers::{worker_environment, worker_log_file};
