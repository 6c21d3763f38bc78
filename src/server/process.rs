// src/server/process.rs
use crate::config::StartCommand;
use crate::error::{Error, Result};
use crate::logs::{LogLine, LogSource, OutputRouter};
use async_process::{Child, Command, ExitStatus, Stdio};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures_lite::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How long a process gets to exit after SIGTERM before it is killed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Working directory and environment of a spawned process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessEnv {
    /// Working directory; the current directory when `None`
    pub directory: Option<PathBuf>,
    /// Variables added to the inherited environment
    pub vars: BTreeMap<String, String>,
}

impl ProcessEnv {
    /// Add or replace one variable
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

/// A spawned dev server process
pub struct ProcessHandle {
    /// Command line, for logging
    command: String,
    /// OS process id
    pid: u32,
    /// Child process, `None` once stopped
    child: Option<Child>,
    /// Feed of output lines
    output: Arc<OutputRouter>,
    /// Tasks reading stdout and stderr
    readers: Vec<JoinHandle<()>>,
    /// Exit status once observed
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The command line the process was started with
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The output feed of this process
    pub fn output(&self) -> &Arc<OutputRouter> {
        &self.output
    }

    /// Whether [`ProcessSupervisor::stop`] already ran on this handle
    pub fn is_stopped(&self) -> bool {
        self.child.is_none()
    }

    /// Check, without blocking, whether the process has exited
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };

        let status = child
            .try_status()
            .map_err(|e| Error::Process(format!("Failed to poll process {}: {}", self.pid, e)))?;
        self.exit_status = status;
        Ok(status)
    }

    /// Whether the process is still running
    pub fn is_alive(&mut self) -> bool {
        self.child.is_some() && matches!(self.try_exit_status(), Ok(None))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // kill_on_drop only reaches the leader
        if let Some(child) = self.child.as_mut() {
            let _ = kill_group(self.pid, child);
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("stopped", &self.child.is_none())
            .field("exit_status", &self.exit_status)
            .finish()
    }
}

/// Starts and stops dev server processes
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    /// Time between SIGTERM and a forced kill
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor with the default grace period
    pub fn new() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Create a supervisor with a custom grace period
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Grace period between SIGTERM and kill
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Spawn `command` and start reading its output.
    ///
    /// On unix the process leads a new process group, so stopping it also
    /// stops whatever it forked. Must be called from within a tokio runtime;
    /// the output readers run as tasks on it. The child is killed if the
    /// handle is dropped without being stopped, together with its process group.
    pub fn start(&self, command: &StartCommand, env: &ProcessEnv) -> Result<ProcessHandle> {
        let command_line = command.to_string();
        let (program, args) = command.program_and_args()?;

        let mut std_command = std::process::Command::new(&program);
        std_command.args(&args);
        for (key, value) in &env.vars {
            std_command.env(key, value);
        }
        if let Some(directory) = &env.directory {
            std_command.current_dir(directory);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.process_group(0);
        }

        let mut process = Command::from(std_command);
        process
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|e| Error::Spawn {
            command: command_line.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        tracing::debug!(pid, command = %command_line, "Spawned dev server process");

        let output = Arc::new(OutputRouter::new(command_line.clone()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, LogSource::Stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, LogSource::Stderr, Arc::clone(&output)));
        }

        Ok(ProcessHandle {
            command: command_line,
            pid,
            child: Some(child),
            output,
            readers,
            exit_status: None,
        })
    }

    /// Terminate the process and everything it forked: SIGTERM to the
    /// process group, wait up to the grace period for the leader, then kill
    /// the group.
    ///
    /// Stopping a handle that was already stopped is a no-op. When the leader
    /// already exited, leftover group members are still killed.
    pub async fn stop(&self, handle: &mut ProcessHandle) -> Result<()> {
        let Some(mut child) = handle.child.take() else {
            return Ok(());
        };
        let pid = handle.pid;

        let result = match child.try_status() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "Dev server process had already exited");
                handle.exit_status = Some(status);
                Ok(())
            }
            _ => self.terminate(pid, &mut child, handle).await,
        };

        // Members that ignored SIGTERM or outlived their leader
        if let Err(e) = kill_group(pid, &mut child) {
            tracing::debug!(pid, error = %e, "Failed to kill dev server process group");
        }

        // Grandchildren may keep the pipes open; stop reading regardless.
        for reader in handle.readers.drain(..) {
            reader.abort();
        }

        result
    }

    async fn terminate(&self, pid: u32, child: &mut Child, handle: &mut ProcessHandle) -> Result<()> {
        if let Err(e) = send_terminate(pid, child) {
            tracing::debug!(pid, error = %e, "Graceful termination failed, killing");
        }

        match tokio::time::timeout(self.grace_period, child.status()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid, %status, "Dev server process exited");
                handle.exit_status = Some(status);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Process(format!(
                "Failed to wait for process {}: {}",
                pid, e
            ))),
            Err(_) => {
                tracing::warn!(pid, grace_period = ?self.grace_period, "Dev server did not exit in time, killing it");
                kill_group(pid, child)?;
                let status = child.status().await.map_err(|e| {
                    Error::Process(format!("Failed to wait for process {}: {}", pid, e))
                })?;
                handle.exit_status = Some(status);
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| Error::Process(format!("Process id {} out of range", pid)))?;
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Process(format!(
            "Failed to send {} to process group {}: {}",
            signal, pgid, e
        ))),
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32, _child: &mut Child) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM)
}

#[cfg(unix)]
fn kill_group(pid: u32, _child: &mut Child) -> Result<()> {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(not(unix))]
fn kill_group(pid: u32, child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(Error::Process(format!("Failed to kill process {}: {}", pid, e))),
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32, child: &mut Child) -> Result<()> {
    child
        .kill()
        .map_err(|e| Error::Process(format!("Failed to kill process {}: {}", pid, e)))
}

fn spawn_reader<R>(stream: R, source: LogSource, output: Arc<OutputRouter>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next().await {
            match line {
                Ok(text) => {
                    output.dispatch(LogLine::new(text, source));
                }
                Err(e) => {
                    tracing::debug!(%source, error = %e, "Stopped reading dev server output");
                    break;
                }
            }
        }
    })
}
