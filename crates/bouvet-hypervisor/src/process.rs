//! Supervision of the Firecracker process.
//!
//! Launching and signalling go through [`ProcessLauncher`] so the
//! supervisor's timing rules can be exercised without a real VMM.

use crate::api::ControlApi;
use crate::error::{HypervisorError, Result};
use crate::models::InstanceInfo;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Interval between API polls while waiting for readiness.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interval between liveness probes while waiting for exit.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Starts VMM processes and delivers signals to them.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn `executable --api-sock <socket_path>` and return its PID.
    async fn launch(&self, executable: &Path, socket_path: &Path) -> Result<u32>;

    /// Send `signal` to `pid`; `None` only probes for existence.
    async fn signal(&self, pid: u32, signal: Option<Signal>) -> std::result::Result<(), Errno>;
}

/// Launcher for real host processes.
///
/// Children spawned here are kept so that exited ones can be reaped before a
/// liveness probe; an unreaped zombie would otherwise still answer signal 0.
#[derive(Default)]
pub struct HostLauncher {
    children: Mutex<HashMap<u32, Child>>,
}

impl HostLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reap `pid` if it is our child and has exited. Returns true if reaped.
    async fn reap(&self, pid: u32) -> bool {
        let mut children = self.children.lock().await;
        let exited = match children.get_mut(&pid) {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        };
        if exited {
            children.remove(&pid);
            tracing::debug!(pid, "Reaped exited VMM process");
        }
        exited
    }
}

#[async_trait]
impl ProcessLauncher for HostLauncher {
    async fn launch(&self, executable: &Path, socket_path: &Path) -> Result<u32> {
        let child = Command::new(executable)
            .arg("--api-sock")
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HypervisorError::Spawn {
                path: executable.to_path_buf(),
                source: e,
            })?;

        let pid = child.id().ok_or_else(|| HypervisorError::Spawn {
            path: executable.to_path_buf(),
            source: std::io::Error::other("process exited before its PID was read"),
        })?;
        self.children.lock().await.insert(pid, child);
        Ok(pid)
    }

    async fn signal(&self, pid: u32, signal: Option<Signal>) -> std::result::Result<(), Errno> {
        if signal.is_none() && self.reap(pid).await {
            return Err(Errno::ESRCH);
        }
        let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
        kill(Pid::from_raw(pid), signal)
    }
}

/// Spawns, watches and terminates the Firecracker process.
#[derive(Clone)]
pub struct Supervisor {
    launcher: Arc<dyn ProcessLauncher>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }

    /// Spawn the VMM with its API socket at `socket_path`.
    ///
    /// Returns as soon as the process exists; the API is not yet reachable.
    pub async fn start(&self, executable: &Path, socket_path: &Path) -> Result<u32> {
        let pid = self.launcher.launch(executable, socket_path).await?;
        tracing::info!(
            pid,
            executable = %executable.display(),
            socket = %socket_path.display(),
            "Firecracker process spawned"
        );
        Ok(pid)
    }

    /// Wait until the API answers `describe_instance`.
    ///
    /// This only means the VMM can take commands, not that a guest runs.
    pub async fn wait_ready(&self, api: &dyn ControlApi, timeout_secs: i64) -> Result<()> {
        poll_instance(api, timeout_secs, |_| true).await.map(|_| ())
    }

    /// Wait until the API reports a running guest.
    pub async fn wait_running(&self, api: &dyn ControlApi, timeout_secs: i64) -> Result<()> {
        poll_instance(api, timeout_secs, InstanceInfo::is_running)
            .await
            .map(|_| ())
    }

    /// Stop `pid`: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Safe to call repeatedly. A process that is already gone (or a pid of
    /// 0, meaning nothing was ever spawned) returns without sending any
    /// signal. The outcome reflects the SIGKILL send only; death is not
    /// confirmed afterwards.
    pub async fn terminate(&self, pid: u32, grace: Duration) -> Result<()> {
        if pid == 0 || self.launcher.signal(pid, None).await.is_err() {
            tracing::debug!(pid, "Firecracker process not running");
            return Ok(());
        }

        tracing::info!(pid, "Stopping Firecracker process");
        match self.launcher.signal(pid, Some(Signal::SIGTERM)).await {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                tracing::debug!(pid, "Firecracker process exited before SIGTERM");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let start = Instant::now();
        loop {
            if self.launcher.signal(pid, None).await.is_err() {
                tracing::info!(
                    pid,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Firecracker process exited"
                );
                break;
            }
            if start.elapsed() >= grace {
                tracing::warn!(pid, grace_secs = grace.as_secs(), "VM still running after grace period");
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        match self.launcher.signal(pid, Some(Signal::SIGKILL)).await {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Poll `describe_instance` every [`READY_POLL_INTERVAL`] until `accept`
/// holds or more than `timeout_secs` have elapsed.
///
/// A single call is cut off once it runs past the deadline by one poll
/// interval, so an API that accepts connections but never answers still
/// times out.
async fn poll_instance(
    api: &dyn ControlApi,
    timeout_secs: i64,
    accept: impl Fn(&InstanceInfo) -> bool,
) -> Result<InstanceInfo> {
    let timeout = u64::try_from(timeout_secs)
        .map(Duration::from_secs)
        .map_err(|_| HypervisorError::Config(format!("invalid timeout {timeout_secs}s")))?;

    let start = Instant::now();
    loop {
        let budget = timeout.saturating_sub(start.elapsed()) + READY_POLL_INTERVAL;
        let last_error = match tokio::time::timeout(budget, api.describe_instance()).await {
            Ok(Ok(info)) if accept(&info) => return Ok(info),
            Ok(Ok(info)) => HypervisorError::InvalidState {
                expected: "Running".into(),
                actual: info.state.to_string(),
            },
            Ok(Err(e)) => e,
            Err(_) => HypervisorError::Transport("describe instance timed out".into()),
        };

        if start.elapsed() > timeout {
            return Err(HypervisorError::Timeout {
                timeout,
                last_error: Box::new(last_error),
            });
        }

        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Create the directory of `socket_path` and clear a stale socket file.
pub(crate) async fn prepare_socket_dir(socket_path: &Path) -> Result<PathBuf> {
    let dir = socket_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| HypervisorError::Config(format!("invalid socket path {}", socket_path.display())))?;
    tokio::fs::create_dir_all(&dir).await?;
    // A stale socket from a previous run makes Firecracker refuse to start
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => tracing::debug!(socket = %socket_path.display(), "Removed stale API socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(dir)
}
