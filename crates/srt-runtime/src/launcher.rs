//! Launcher boundary
//!
//! Stages describe what to run with a [`LaunchRequest`] and get back an opaque
//! [`ProcessHandle`]. How the command reaches its nodes is the launcher's
//! business: [`SrunLauncher`] goes through SLURM and pyxis containers,
//! [`LocalLauncher`] runs everything on the current host.

use crate::{Result, RuntimeError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{debug, warn};

/// A command to run on a set of nodes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub command: Vec<String>,
    pub nodes: Vec<String>,
    /// File receiving stdout and stderr
    pub output: PathBuf,
    pub container_image: Option<String>,
    /// Host path to container path
    pub container_mounts: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    /// Bash run before the command, chained with `&&`
    pub preamble: Option<String>,
    /// Wrap in `bash -c` with exports, otherwise run the argv directly
    pub wrap_in_bash: bool,
}

impl LaunchRequest {
    /// Create a new request for a command on a set of nodes
    pub fn new(command: Vec<String>, nodes: Vec<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            command,
            nodes,
            output: output.into(),
            container_image: None,
            container_mounts: BTreeMap::new(),
            env: BTreeMap::new(),
            preamble: None,
            wrap_in_bash: true,
        }
    }

    /// Run inside a container with the given mounts
    pub fn with_container(mut self, image: impl Into<String>, mounts: BTreeMap<String, String>) -> Self {
        self.container_image = Some(image.into());
        self.container_mounts = mounts;
        self
    }

    /// Add environment variables
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble;
        self
    }

    /// The bash script run by `bash -c`
    pub fn bash_script(&self) -> String {
        let mut parts = Vec::new();
        if let Some(preamble) = &self.preamble {
            parts.push(preamble.clone());
        }
        for (name, value) in &self.env {
            parts.push(format!("export {}={}", name, shell_quote(value)));
        }
        parts.push(shell_join(&self.command));
        parts.join(" && ")
    }

    /// Command printed in logs
    pub fn display_command(&self) -> String {
        shell_join(&self.command)
    }
}

/// Quote a word for POSIX shells
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

/// Quote and join an argv for POSIX shells
pub fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
}

/// Opaque handle to a launched process
pub trait ProcessHandle: Send + fmt::Debug {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Exit code once the process has exited, `None` while running
    fn poll(&mut self) -> Result<Option<i32>>;

    /// Request graceful termination
    fn terminate(&mut self) -> Result<()>;

    /// Force the process down
    fn kill(&mut self) -> Result<()>;
}

/// Starts commands on nodes
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch a request and return its handle
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>>;
}

/// Handle over a local child process that leads its own process group
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
    exit_code: Option<i32>,
}

impl ChildHandle {
    /// Create a new handle over a spawned child
    pub fn new(child: Child) -> Self {
        Self { child, exit_code: None }
    }

    fn signal_group(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let pid = Pid::from_raw(self.child.id() as i32);
        match killpg(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RuntimeError::Process(format!(
                "Failed to send {} to process group {}: {}",
                signal, pid, e
            ))),
        }
    }
}

/// Exit code of a finished process, `128 + signal` when killed by a signal
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn poll(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        match self.child.try_wait()? {
            Some(status) => {
                self.exit_code = Some(exit_code_of(status));
                Ok(self.exit_code)
            }
            None => Ok(None),
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        self.signal_group(nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        self.signal_group(nix::sys::signal::Signal::SIGKILL)?;
        if let Err(e) = self.child.kill() {
            debug!("Direct kill after SIGKILL to group failed: {}", e);
        }
        Ok(())
    }
}

fn spawn(mut command: Command, request: &LaunchRequest, stdio_to_file: bool) -> Result<Box<dyn ProcessHandle>> {
    command.stdin(Stdio::null()).process_group(0);

    if stdio_to_file {
        if let Some(parent) = request.output.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = File::create(&request.output)?;
        command.stdout(log.try_clone()?).stderr(log);
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let child = command.spawn().map_err(|e| {
        RuntimeError::Launch(format!("Failed to spawn {}: {}", request.display_command(), e))
    })?;
    Ok(Box::new(ChildHandle::new(child)))
}

/// Launches through `srun` with pyxis container flags
#[derive(Debug, Clone)]
pub struct SrunLauncher {
    srun: String,
    overlap: bool,
}

impl Default for SrunLauncher {
    fn default() -> Self {
        Self {
            srun: "srun".to_string(),
            overlap: true,
        }
    }
}

impl SrunLauncher {
    /// Create a new launcher using `srun` from `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Full `srun` argv for a request
    pub fn build_argv(&self, request: &LaunchRequest) -> Vec<String> {
        let mut argv = vec![self.srun.clone()];
        if self.overlap {
            argv.push("--overlap".to_string());
        }
        let count = request.nodes.len().max(1).to_string();
        argv.extend(["--nodes".to_string(), count.clone(), "--ntasks".to_string(), count]);
        if !request.nodes.is_empty() {
            argv.push("--nodelist".to_string());
            argv.push(request.nodes.join(","));
        }
        argv.push("--output".to_string());
        argv.push(request.output.to_string_lossy().into_owned());

        if let Some(image) = &request.container_image {
            argv.push("--container-image".to_string());
            argv.push(image.clone());
            argv.push("--no-container-entrypoint".to_string());
            argv.push("--no-container-mount-home".to_string());
            if !request.container_mounts.is_empty() {
                let mounts = request
                    .container_mounts
                    .iter()
                    .map(|(host, container)| format!("{}:{}", host, container))
                    .collect::<Vec<_>>()
                    .join(",");
                argv.push("--container-mounts".to_string());
                argv.push(mounts);
            }
        }

        if request.wrap_in_bash {
            argv.push("bash".to_string());
            argv.push("-c".to_string());
            argv.push(request.bash_script());
        } else {
            argv.extend(request.command.iter().cloned());
        }
        argv
    }
}

#[async_trait]
impl Launcher for SrunLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>> {
        let argv = self.build_argv(&request);
        debug!("Starting srun: {}", shell_join(&argv));

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        spawn(command, &request, false)
    }
}

/// Runs every request on the local host, ignoring nodes and containers
#[derive(Debug, Clone, Default)]
pub struct LocalLauncher;

impl LocalLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>> {
        if request.nodes.len() > 1 {
            warn!(
                "Local launcher runs {} on this host instead of {} nodes",
                request.display_command(),
                request.nodes.len()
            );
        }

        let command = if request.wrap_in_bash {
            let mut command = Command::new("bash");
            command.arg("-c").arg(request.bash_script());
            command
        } else {
            let program = request
                .command
                .first()
                .ok_or_else(|| RuntimeError::Launch("Empty command".to_string()))?;
            let mut command = Command::new(program);
            command.args(&request.command[1..]).envs(&request.env);
            command
        };
        debug!("Starting local process: {}", request.display_command());
        spawn(command, &request, true)
    }
}
