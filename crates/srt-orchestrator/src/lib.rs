//! # srt-orchestrator
//!
//! Drives one benchmark job through its stages: head infrastructure, workers,
//! frontends, readiness, benchmark and cleanup.

pub mod orchestrator;
pub mod stages;

pub use orchestrator::{Orchestrator, Stage};

use srt_core::config::LoggingConfig;
use srt_runtime::RuntimeError;

/// Job-level error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Readiness timeout: {0}")]
    ReadinessTimeout(String),

    #[error("Benchmark failed with exit code {code}")]
    BenchmarkFailure { code: i32 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JobError>;

impl JobError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Short error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => "configuration",
            JobError::Infrastructure(_) => "infrastructure",
            JobError::Launch(_) => "launch",
            JobError::ReadinessTimeout(_) => "readiness",
            JobError::BenchmarkFailure { .. } => "benchmark",
            JobError::Cancelled(_) => "cancelled",
            JobError::Io(_) => "io",
        }
    }
}

impl From<srt_core::Error> for JobError {
    fn from(err: srt_core::Error) -> Self {
        match err {
            srt_core::Error::Io(e) => JobError::Io(e),
            other => JobError::Configuration(other.to_string()),
        }
    }
}

impl From<RuntimeError> for JobError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled(msg) => JobError::Cancelled(msg),
            RuntimeError::Core(e) => e.into(),
            RuntimeError::Io(e) => JobError::Io(e),
            other => JobError::Launch(other.to_string()),
        }
    }
}

/// Initialize logging and tracing
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };
    installed.map_err(|e| JobError::Configuration(format!("Failed to initialize logging: {}", e)))
}
