//! # bouvet-hypervisor
//!
//! Firecracker hypervisor driver for Bouvet sandboxes.
//!
//! The driver owns one Firecracker process per sandbox and talks to it over
//! the Firecracker API socket. It tracks readiness, sequences the boot, and
//! handles devices that arrive before the VMM exists as well as block
//! devices hotplugged after the guest runs.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bouvet_hypervisor::{BlockDrive, Device, FileStore, Firecracker, HypervisorConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> bouvet_hypervisor::Result<()> {
//! let config = HypervisorConfig::default();
//! let store = Arc::new(FileStore::open(config.sandbox_dir("sb-1"))?);
//! let fc = Firecracker::create("sb-1", config, store);
//!
//! // Queued until the API is up, applied during boot
//! fc.add_device(Device::Block(BlockDrive {
//!     id: "data".into(),
//!     file: "/var/lib/bouvet/data.ext4".into(),
//!     index: 0,
//! }))
//! .await?;
//!
//! fc.start_sandbox(30).await?;
//!
//! // Swap the backing file of pool slot 1 in the running guest
//! fc.hotplug_add_device(Device::Block(BlockDrive {
//!     id: "scratch".into(),
//!     file: "/dev/dm-4".into(),
//!     index: 1,
//! }))
//! .await?;
//!
//! fc.stop_sandbox().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Boot sequence
//!
//! 1. Spawn `firecracker --api-sock <socket>`, persist the PID, wait for the API
//! 2. Machine config (memory, vCPUs, no hyperthreading)
//! 3. Boot source (kernel + command line)
//! 4. Read-only `rootfs` drive
//! 5. Eight placeholder drives `drive_0`..`drive_7` for hotplug
//! 6. Devices queued before the API was reachable
//! 7. `InstanceStart`, then wait for the guest to run

mod api;
mod boot;
mod config;
mod devices;
mod disk_pool;
mod error;
mod hypervisor;
mod models;
mod process;
mod state;
mod store;
mod threads;

pub use api::{ApiConnector, ControlApi, ControlChannel, SocketConnector};
pub use boot::{BootStep, ROOTFS_DRIVE_ID};
pub use config::{
    backend_kernel_params, kernel_cmdline, HypervisorConfig, Param, API_READY_TIMEOUT_SECS,
    STOP_SANDBOX_TIMEOUT,
};
pub use devices::{
    BlockDrive, Device, DeviceType, Endpoint, PendingDevice, TapEndpoint, VsockDevice, VSOCK_ID,
};
pub use disk_pool::{drive_id, DISK_POOL_SIZE};
pub use error::{HypervisorError, Result};
pub use hypervisor::{Capabilities, Firecracker, FirecrackerBuilder};
pub use models::{
    ActionType, BootSource, Drive, InstanceActionInfo, InstanceInfo, InstanceState,
    MachineConfiguration, NetworkInterface, PartialDrive, Vsock,
};
pub use process::{
    HostLauncher, ProcessLauncher, Supervisor, EXIT_POLL_INTERVAL, READY_POLL_INTERVAL,
};
pub use state::{Readiness, ReadinessView, VmmState};
pub use store::{FileStore, HypervisorInfo, SandboxStore, StoreItem};
pub use threads::{vcpu_thread_ids, vcpu_thread_ids_in, VcpuThreadIds, VCPU_THREAD_PREFIX};

/// Re-exported so launcher implementations can name signals.
pub use nix::sys::signal::Signal;
pub use nix::errno::Errno;
