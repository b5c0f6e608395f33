//! # srt-runtime
//!
//! Runtime machinery for srtctl jobs.
//!
//! This crate provides:
//! - The launcher boundary (`srun` on a cluster, plain `bash` locally)
//! - Managed process handles with graceful stop and forced kill
//! - The process registry and its background liveness monitor
//! - Readiness probing of frontends and TCP ports
//! - Signal routing into a shared cancellation token
//! - SLURM allocation discovery

use thiserror::Error;

pub mod health;
pub mod launcher;
pub mod process;
pub mod registry;
pub mod signals;
pub mod slurm;

pub use health::{HealthSchema, ReadinessOutcome, ReadinessProber, WorkerHealthResult};
pub use launcher::{LaunchRequest, Launcher, LocalLauncher, ProcessHandle, SrunLauncher};
pub use process::ManagedProcess;
pub use registry::{spawn_monitor, FailureDetail, ProcessRegistry};
pub use tokio_util::sync::CancellationToken;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime error types
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Health check failed: {0}")]
    Health(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Core error: {0}")]
    Core(#[from] srt_core::Error),
}

impl RuntimeError {
    /// Check if the error is worth retrying on the next poll
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Http(_) | RuntimeError::Health(_))
    }

    /// Check if the error came from a cancellation request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled(_))
    }
}
