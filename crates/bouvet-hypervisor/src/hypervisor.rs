//! Firecracker instance - one per sandbox.

use crate::api::{ApiConnector, ControlApi, SocketConnector};
use crate::config::{HypervisorConfig, STOP_SANDBOX_TIMEOUT};
use crate::devices::PendingDevice;
use crate::error::Result;
use crate::process::{HostLauncher, ProcessLauncher, Supervisor};
use crate::state::{Readiness, VmmState};
use crate::store::{HypervisorInfo, SandboxStore, StoreItem};
use crate::threads::{self, VcpuThreadIds};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Features this backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub block_device_hotplug: bool,
    pub fs_sharing: bool,
}

/// Driver for one Firecracker VMM and its guest.
///
/// Creating an instance only sets up state; [`start_sandbox`] launches the
/// VMM and boots the guest. Devices may be added before or after that.
///
/// [`start_sandbox`]: Firecracker::start_sandbox
pub struct Firecracker {
    pub(crate) id: String,
    pub(crate) config: HypervisorConfig,
    pub(crate) socket_path: PathBuf,
    pub(crate) readiness: Readiness,
    pub(crate) info: Mutex<HypervisorInfo>,
    pub(crate) pending: Mutex<Vec<PendingDevice>>,
    pub(crate) disk_pool: Mutex<Vec<String>>,
    pub(crate) supervisor: Supervisor,
    pub(crate) store: Arc<dyn SandboxStore>,
    connector: Arc<dyn ApiConnector>,
    api: Mutex<Option<Arc<dyn ControlApi>>>,
}

/// Builder for [`Firecracker`].
///
/// The launcher and connector default to the host implementations.
pub struct FirecrackerBuilder {
    id: String,
    config: HypervisorConfig,
    store: Arc<dyn SandboxStore>,
    connector: Arc<dyn ApiConnector>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl FirecrackerBuilder {
    /// Use `connector` to build control channels.
    pub fn connector(mut self, connector: Arc<dyn ApiConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Use `launcher` to spawn and signal the VMM.
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Create the instance.
    ///
    /// Information saved by a previous run (the VMM PID) is loaded if
    /// present; its absence is expected on first creation.
    pub fn create(self) -> Firecracker {
        let socket_path = self.config.socket_path(&self.id);

        let info = match self.store.load(StoreItem::Hypervisor) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::info!(sandbox_id = %self.id, error = %e, "Discarding unreadable hypervisor info");
                HypervisorInfo::default()
            }),
            Err(e) => {
                tracing::info!(sandbox_id = %self.id, error = %e, "No info could be fetched");
                HypervisorInfo::default()
            }
        };

        tracing::debug!(
            sandbox_id = %self.id,
            socket = %socket_path.display(),
            pid = info.pid,
            "Firecracker instance created"
        );

        Firecracker {
            id: self.id,
            config: self.config,
            socket_path,
            readiness: Readiness::new(),
            info: Mutex::new(info),
            pending: Mutex::new(Vec::new()),
            disk_pool: Mutex::new(Vec::new()),
            supervisor: Supervisor::new(self.launcher),
            store: self.store,
            connector: self.connector,
            api: Mutex::new(None),
        }
    }
}

impl Firecracker {
    /// Start building an instance for sandbox `id`.
    pub fn builder(
        id: impl Into<String>,
        config: HypervisorConfig,
        store: Arc<dyn SandboxStore>,
    ) -> FirecrackerBuilder {
        FirecrackerBuilder {
            id: id.into(),
            config,
            store,
            connector: Arc::new(SocketConnector),
            launcher: Arc::new(HostLauncher::new()),
        }
    }

    /// Create an instance using the host launcher and socket connector.
    pub fn create(
        id: impl Into<String>,
        config: HypervisorConfig,
        store: Arc<dyn SandboxStore>,
    ) -> Self {
        Self::builder(id, config, store).create()
    }

    /// Sandbox id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the Firecracker API socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Configuration the instance was created with.
    pub fn hypervisor_config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Current readiness.
    pub async fn state(&self) -> VmmState {
        self.readiness.get().await
    }

    /// PID of the VMM, 0 if none was ever started.
    pub async fn pid(&self) -> u32 {
        self.info.lock().await.pid
    }

    /// Ids of the preallocated pool drives, empty before boot.
    pub async fn disk_pool(&self) -> Vec<String> {
        self.disk_pool.lock().await.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_device_hotplug: true,
            fs_sharing: false,
        }
    }

    /// Path of the guest console. Firecracker's console is not exposed.
    pub fn console_path(&self) -> Option<PathBuf> {
        None
    }

    /// Memory cannot be resized; reports no change.
    pub async fn resize_memory(&self, requested_mib: u32) -> Result<u32> {
        tracing::debug!(sandbox_id = %self.id, requested_mib, "resize_memory: not supported");
        Ok(0)
    }

    /// vCPUs cannot be resized; reports (current, new) as both the
    /// configured count.
    pub async fn resize_vcpus(&self, requested: u32) -> Result<(u32, u32)> {
        tracing::debug!(sandbox_id = %self.id, requested, "resize_vcpus: not supported");
        Ok((self.config.vcpu_count, self.config.vcpu_count))
    }

    /// Map of vCPU index to host thread id, for cgroup placement.
    pub async fn vcpu_thread_ids(&self) -> Result<VcpuThreadIds> {
        threads::vcpu_thread_ids(self.pid().await)
    }

    /// Whether the guest is running according to the API.
    pub async fn vm_running(&self) -> bool {
        let api = self.client().await;
        crate::devices::vm_running(api.as_ref()).await
    }

    /// Stop the VMM: SIGTERM, then SIGKILL after the stop grace period.
    pub async fn stop_sandbox(&self) -> Result<()> {
        tracing::info!(sandbox_id = %self.id, "Stopping firecracker VM");
        let result = self
            .supervisor
            .terminate(self.pid().await, STOP_SANDBOX_TIMEOUT)
            .await;
        match &result {
            Ok(()) => tracing::info!(sandbox_id = %self.id, "Firecracker VM stopped"),
            Err(e) => tracing::error!(sandbox_id = %self.id, error = %e, "Failed to stop firecracker VM"),
        }
        result
    }

    /// Forget the API connection; readiness returns to NotReady and new
    /// devices are queued again.
    pub async fn disconnect(&self) {
        self.readiness.disconnect().await;
        self.api.lock().await.take();
    }

    /// Control channel, built on first use.
    pub(crate) async fn client(&self) -> Arc<dyn ControlApi> {
        let mut api = self.api.lock().await;
        match api.as_ref() {
            Some(api) => api.clone(),
            None => {
                let fresh = self.connector.connect(&self.socket_path);
                *api = Some(fresh.clone());
                fresh
            }
        }
    }

    /// Replace the control channel with a new connection.
    pub(crate) async fn reconnect(&self) -> Arc<dyn ControlApi> {
        let fresh = self.connector.connect(&self.socket_path);
        *self.api.lock().await = Some(fresh.clone());
        fresh
    }
}
