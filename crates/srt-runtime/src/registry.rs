//! Process registry and supervisor
//!
//! The registry owns every process a job launches. The orchestrator adds
//! processes stage by stage, a background monitor polls them for unexpected
//! exits, and cleanup drains everything exactly once at the end.

use crate::process::ManagedProcess;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll spacing while draining
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit report for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub name: String,
    pub node: String,
    pub critical: bool,
    /// `None` while the process was still running
    pub exit_code: Option<i32>,
    pub log_file: PathBuf,
}

#[derive(Debug, Default)]
struct RegistryInner {
    processes: Vec<ManagedProcess>,
    /// Processes whose exit has already been reported
    reported: HashSet<String>,
    failed: bool,
    draining: bool,
    drained: bool,
}

/// Registry of all processes launched for a job
#[derive(Debug)]
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
    /// Flips to true once the first cleanup has returned
    cleanup_done: watch::Sender<bool>,
    terminate_grace: Duration,
    cleanup_timeout: Duration,
}

impl ProcessRegistry {
    /// Create a new registry
    pub fn new(terminate_grace: Duration, cleanup_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            cleanup_done: watch::Sender::new(false),
            terminate_grace,
            cleanup_timeout,
        }
    }

    /// Register a launched process
    pub async fn add(&self, process: ManagedProcess) {
        debug!("Registered {} on {}", process.name, process.node);
        self.inner.lock().await.processes.push(process);
    }

    /// Register several launched processes
    pub async fn add_many(&self, processes: impl IntoIterator<Item = ManagedProcess>) {
        let mut inner = self.inner.lock().await;
        for process in processes {
            debug!("Registered {} on {}", process.name, process.node);
            inner.processes.push(process);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.processes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.processes.is_empty()
    }

    /// Names of all registered processes, in launch order
    pub async fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .processes
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Exit code of a registered process, `None` while it runs or if unknown
    pub async fn exit_code(&self, name: &str) -> Option<i32> {
        let mut inner = self.inner.lock().await;
        inner
            .processes
            .iter_mut()
            .find(|p| p.name == name)
            .and_then(|p| p.poll())
    }

    /// Poll every process and report whether a critical one has exited.
    ///
    /// Once a critical exit has been seen this keeps returning true. Each exit
    /// is logged once. Exits during cleanup are expected and not counted.
    pub async fn check_failures(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.draining {
            return inner.failed;
        }

        let mut newly_failed = false;
        let RegistryInner {
            processes, reported, ..
        } = &mut *inner;
        for process in processes.iter_mut() {
            let Some(code) = process.poll() else {
                continue;
            };
            if !reported.insert(process.name.clone()) {
                continue;
            }
            if process.critical {
                error!(
                    "Critical process {} on {} exited with code {} (log: {})",
                    process.name,
                    process.node,
                    code,
                    process.log_file.display()
                );
                newly_failed = true;
            } else if code != 0 {
                warn!(
                    "Process {} on {} exited with code {} (log: {})",
                    process.name,
                    process.node,
                    code,
                    process.log_file.display()
                );
            } else {
                info!("Process {} on {} exited", process.name, process.node);
            }
        }

        inner.failed |= newly_failed;
        inner.failed
    }

    /// Whether a critical failure has been recorded
    pub async fn has_failed(&self) -> bool {
        self.inner.lock().await.failed
    }

    /// Terminate everything, escalate to kill after the grace period, and
    /// wait for exits up to the cleanup timeout.
    ///
    /// Safe to call repeatedly and concurrently. Only the first call drains,
    /// later calls return once that drain has finished.
    pub async fn cleanup(&self) {
        let first = {
            let mut inner = self.inner.lock().await;
            !std::mem::replace(&mut inner.draining, true)
        };
        if !first {
            debug!("Cleanup already started, waiting for it to finish");
            let mut done = self.cleanup_done.subscribe();
            // the sender lives in self, so this cannot see a closed channel
            let _ = done.wait_for(|finished| *finished).await;
            return;
        }

        self.drain().await;
        self.cleanup_done.send_replace(true);
    }

    async fn drain(&self) {
        {
            let mut inner = self.inner.lock().await;
            let mut running = 0;
            for process in inner.processes.iter_mut() {
                if process.is_running() {
                    process.terminate();
                    running += 1;
                }
            }
            if running == 0 {
                inner.drained = true;
                info!("Cleanup: no running processes");
                return;
            }
            info!("Cleanup: sent SIGTERM to {} processes", running);
        }

        let started = Instant::now();
        let grace_deadline = started + self.terminate_grace.min(self.cleanup_timeout);
        let hard_deadline = started + self.cleanup_timeout;
        let mut killed = false;

        loop {
            let remaining = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                if !killed && now >= grace_deadline {
                    for process in inner.processes.iter_mut() {
                        if process.is_running() {
                            warn!("{} ignored SIGTERM, sending SIGKILL", process.name);
                            process.kill();
                        }
                    }
                    killed = true;
                }
                let remaining: Vec<String> = inner
                    .processes
                    .iter_mut()
                    .filter_map(|p| if p.is_running() { Some(p.name.clone()) } else { None })
                    .collect();
                if remaining.is_empty() {
                    inner.drained = true;
                }
                remaining
            };

            if remaining.is_empty() {
                info!("Cleanup complete in {:?}", started.elapsed());
                return;
            }
            if Instant::now() >= hard_deadline {
                error!(
                    "Cleanup timed out after {:?}, still running: {}",
                    self.cleanup_timeout,
                    remaining.join(", ")
                );
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Whether cleanup has finished with every process exited
    pub async fn is_drained(&self) -> bool {
        self.inner.lock().await.drained
    }

    /// Exit status and log location of every critical process
    pub async fn failure_details(&self) -> Vec<FailureDetail> {
        let mut inner = self.inner.lock().await;
        inner
            .processes
            .iter_mut()
            .filter(|p| p.critical)
            .map(|p| FailureDetail {
                exit_code: p.poll(),
                name: p.name.clone(),
                node: p.node.clone(),
                critical: p.critical,
                log_file: p.log_file.clone(),
            })
            .collect()
    }

    /// Log the exit status and log location of every critical process
    pub async fn print_failure_details(&self) {
        let details = self.failure_details().await;
        if details.is_empty() {
            error!("Job failed before any process was launched");
            return;
        }
        error!("Job failed, process summary:");
        for detail in details {
            let status = match detail.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "still running".to_string(),
            };
            error!(
                "  {} on {}: {} (log: {})",
                detail.name,
                detail.node,
                status,
                detail.log_file.display()
            );
        }
    }
}

/// Poll the registry in the background and cancel on a critical failure
pub fn spawn_monitor(
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Process monitor stopping");
                    break;
                }
                _ = sleep(interval) => {
                    if registry.check_failures().await {
                        error!("Critical process failure detected, cancelling job");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    })
}
