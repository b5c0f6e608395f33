//! Managed processes
//!
//! A [`ManagedProcess`] pairs a launcher handle with what the supervisor needs
//! to report on it: a name, the node it runs on, its log file and whether its
//! death should bring the job down.

use crate::launcher::ProcessHandle;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Poll spacing while waiting for a process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A launched external process tracked by the registry
pub struct ManagedProcess {
    pub name: String,
    pub node: String,
    pub log_file: PathBuf,
    /// Whether an exit of this process fails the job
    pub critical: bool,
    pub started_at: DateTime<Utc>,
    handle: Box<dyn ProcessHandle>,
    exit_code: Option<i32>,
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("critical", &self.critical)
            .field("pid", &self.handle.id())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl ManagedProcess {
    /// Create a new managed process from a launcher handle
    pub fn new(
        name: impl Into<String>,
        handle: Box<dyn ProcessHandle>,
        log_file: impl Into<PathBuf>,
        node: impl Into<String>,
        critical: bool,
    ) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            log_file: log_file.into(),
            critical,
            started_at: Utc::now(),
            handle,
            exit_code: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.id()
    }

    /// Exit code, polling the handle if the process has not been seen to exit.
    ///
    /// A handle that cannot be polled is treated as exited with code -1.
    pub fn poll(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            match self.handle.poll() {
                Ok(code) => self.exit_code = code,
                Err(e) => {
                    warn!("Failed to poll {}: {}, treating it as exited", self.name, e);
                    self.exit_code = Some(-1);
                }
            }
        }
        self.exit_code
    }

    /// Last observed exit code without polling
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_running(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Time since launch
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Send a graceful termination request if still running
    pub fn terminate(&mut self) {
        if !self.is_running() {
            return;
        }
        match self.handle.terminate() {
            Ok(()) => debug!("Sent SIGTERM to {}", self.name),
            Err(e) => warn!("Failed to terminate {}: {}", self.name, e),
        }
    }

    /// Force the process down if still running
    pub fn kill(&mut self) {
        if !self.is_running() {
            return;
        }
        match self.handle.kill() {
            Ok(()) => debug!("Sent SIGKILL to {}", self.name),
            Err(e) => warn!("Failed to kill {}: {}", self.name, e),
        }
    }

    /// Wait until the process exits or the timeout elapses
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<i32> {
        let waited = timeout(limit, async {
            loop {
                if let Some(code) = self.poll() {
                    return code;
                }
                sleep(EXIT_POLL_INTERVAL).await;
            }
        })
        .await;
        waited.ok()
    }

    /// Terminate, wait out the grace period, then kill
    pub async fn stop(&mut self, grace: Duration) -> Option<i32> {
        if let Some(code) = self.poll() {
            return Some(code);
        }

        info!("Stopping {} on {}", self.name, self.node);
        self.terminate();

        match self.wait_exit(grace).await {
            Some(code) => {
                info!("{} stopped gracefully", self.name);
                Some(code)
            }
            None => {
                warn!("{} did not stop within {:?}, forcing kill", self.name, grace);
                self.kill();
                self.wait_exit(grace).await
            }
        }
    }
}
