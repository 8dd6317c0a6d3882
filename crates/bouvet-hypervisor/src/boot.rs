//! Boot sequence of a Firecracker sandbox.

use crate::config::{kernel_cmdline, API_READY_TIMEOUT_SECS, STOP_SANDBOX_TIMEOUT};
use crate::disk_pool;
use crate::error::{HypervisorError, Result};
use crate::hypervisor::Firecracker;
use crate::models::{BootSource, Drive, InstanceActionInfo, MachineConfiguration};
use crate::process::prepare_socket_dir;
use crate::state::VmmState;
use crate::store::StoreItem;
use std::fmt;
use std::time::Instant;

/// Drive id of the guest root filesystem.
pub const ROOTFS_DRIVE_ID: &str = "rootfs";

/// Steps of [`Firecracker::start_sandbox`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStep {
    /// Spawn the VMM, persist its PID, wait for the API
    Launch,
    /// vCPUs and memory
    MachineConfig,
    /// Kernel path and command line
    Kernel,
    /// `PUT /boot-source`
    BootSource,
    /// Root filesystem drive
    Rootfs,
    /// Placeholder drives for hotplug
    DiskPool,
    /// Devices queued before the API was reachable
    PendingDevices,
    /// `InstanceStart` action
    InstanceStart,
    /// Wait for the guest to run
    WaitRunning,
}

impl fmt::Display for BootStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStep::Launch => "launch",
            BootStep::MachineConfig => "machine config",
            BootStep::Kernel => "kernel",
            BootStep::BootSource => "boot source",
            BootStep::Rootfs => "rootfs",
            BootStep::DiskPool => "disk pool",
            BootStep::PendingDevices => "pending devices",
            BootStep::InstanceStart => "instance start",
            BootStep::WaitRunning => "wait running",
        };
        write!(f, "{name}")
    }
}

trait StepContext<T> {
    fn step(self, step: BootStep) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: BootStep) -> Result<T> {
        self.map_err(|e| HypervisorError::boot(step, e))
    }
}

impl Firecracker {
    /// Launch the VMM, configure the guest and boot it.
    ///
    /// Waits up to `timeout_secs` for the guest to report running. On any
    /// failure the VMM is terminated; a failing termination is attached to
    /// the returned [`HypervisorError::Boot`] rather than replacing it.
    /// Calls that already succeeded are not undone otherwise.
    pub async fn start_sandbox(&self, timeout_secs: i64) -> Result<()> {
        let start = Instant::now();
        tracing::info!(sandbox_id = %self.id, "Starting firecracker sandbox");

        let mut spawned = None;
        match self.boot(timeout_secs, &mut spawned).await {
            Ok(()) => {
                tracing::info!(
                    sandbox_id = %self.id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Firecracker sandbox running"
                );
                Ok(())
            }
            Err(mut err) => {
                tracing::error!(sandbox_id = %self.id, error = %err, "Sandbox boot failed");

                // Only a VMM spawned by this call is ours to kill; a PID
                // recovered from the store is left to stop_sandbox
                let pid = spawned.unwrap_or(0);
                if let Err(cleanup_err) = self.supervisor.terminate(pid, STOP_SANDBOX_TIMEOUT).await {
                    tracing::warn!(sandbox_id = %self.id, pid, error = %cleanup_err, "Cleanup after failed boot failed");
                    if let HypervisorError::Boot { cleanup, .. } = &mut err {
                        *cleanup = Some(Box::new(cleanup_err));
                    }
                }
                self.disconnect().await;
                Err(err)
            }
        }
    }

    async fn boot(&self, timeout_secs: i64, spawned: &mut Option<u32>) -> Result<()> {
        self.launch(spawned).await.step(BootStep::Launch)?;

        let api = self.client().await;
        api.put_machine_config(&MachineConfiguration {
            vcpu_count: self.config.vcpu_count,
            mem_size_mib: self.config.memory_mib,
            ht_enabled: false,
        })
        .await
        .step(BootStep::MachineConfig)?;

        let kernel_image_path = self.config.kernel_asset_path().step(BootStep::Kernel)?;
        let boot_args = kernel_cmdline(&self.config.kernel_params);
        tracing::debug!(
            sandbox_id = %self.id,
            kernel = %kernel_image_path.display(),
            boot_args = %boot_args,
            "Setting boot source"
        );
        api.put_boot_source(&BootSource {
            kernel_image_path,
            boot_args,
        })
        .await
        .step(BootStep::BootSource)?;

        let rootfs = self.config.rootfs_asset_path().step(BootStep::Rootfs)?;
        tracing::debug!(sandbox_id = %self.id, path = %rootfs.display(), "Setting VM rootfs");
        // Not the root device: the command line's root= names a partition inside it
        api.put_drive(&Drive {
            drive_id: ROOTFS_DRIVE_ID.to_string(),
            path_on_host: rootfs,
            is_root_device: false,
            is_read_only: true,
        })
        .await
        .step(BootStep::Rootfs)?;

        let slots = disk_pool::preallocate(api.as_ref(), self.store.as_ref())
            .await
            .step(BootStep::DiskPool)?;
        *self.disk_pool.lock().await = slots;

        self.flush_pending_devices()
            .await
            .step(BootStep::PendingDevices)?;

        tracing::info!(sandbox_id = %self.id, "Starting VM");
        let api = self.reconnect().await;
        api.create_action(&InstanceActionInfo::instance_start())
            .await
            .step(BootStep::InstanceStart)?;
        self.readiness
            .transition(VmmState::VmReady)
            .await
            .step(BootStep::InstanceStart)?;

        self.supervisor
            .wait_running(api.as_ref(), timeout_secs)
            .await
            .step(BootStep::WaitRunning)
    }

    /// Spawn the VMM and wait for its API.
    ///
    /// The PID is persisted before waiting so that a runtime dying during
    /// the wait still leaves a process it can find and kill. `spawned` is
    /// set as soon as the process exists.
    async fn launch(&self, spawned: &mut Option<u32>) -> Result<()> {
        prepare_socket_dir(&self.socket_path).await?;

        let pid = self
            .supervisor
            .start(&self.config.hypervisor_path, &self.socket_path)
            .await?;
        *spawned = Some(pid);

        let info = {
            let mut info = self.info.lock().await;
            info.pid = pid;
            *info
        };
        self.store
            .store(StoreItem::Hypervisor, &serde_json::to_vec(&info)?)?;

        let api = self.client().await;
        self.supervisor
            .wait_ready(api.as_ref(), API_READY_TIMEOUT_SECS)
            .await?;

        self.readiness.transition(VmmState::ApiReady).await
    }
}
