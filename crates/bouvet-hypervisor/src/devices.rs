//! Device descriptors and the queue/dispatch/hotplug logic.
//!
//! Devices handed to the driver before the API is reachable are queued and
//! flushed in order during boot. Afterwards they are sent straight to the
//! API. Once the guest runs, only block devices can change, and only by
//! swapping the backing file of a preallocated pool slot.

use crate::api::ControlApi;
use crate::disk_pool;
use crate::error::{HypervisorError, Result};
use crate::hypervisor::Firecracker;
use crate::models::{
    Drive, InstanceActionInfo, InstanceState, NetworkInterface, PartialDrive, Vsock,
};
use crate::state::VmmState;
use std::fmt;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

/// Vsock device id used for the single vsock device of a guest.
pub const VSOCK_ID: &str = "root";

/// Device classes known to the sandbox runtime.
///
/// Other backends accept more classes than Firecracker does; the tag is kept
/// so unsupported requests can be reported by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Network,
    Block,
    Vsock,
    Vfio,
    SharedFs,
    SerialPort,
    VhostUser,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Network => write!(f, "network"),
            DeviceType::Block => write!(f, "block"),
            DeviceType::Vsock => write!(f, "vsock"),
            DeviceType::Vfio => write!(f, "vfio"),
            DeviceType::SharedFs => write!(f, "shared-fs"),
            DeviceType::SerialPort => write!(f, "serial-port"),
            DeviceType::VhostUser => write!(f, "vhost-user"),
        }
    }
}

/// Host side of a guest network interface.
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Logical interface name, used as the Firecracker interface id
    fn name(&self) -> &str;
    /// Guest MAC address
    fn hardware_addr(&self) -> &str;
    /// Name of the host tap device backing the interface
    fn tap_name(&self) -> &str;
}

/// Plain [`Endpoint`] for a tap device created elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapEndpoint {
    pub name: String,
    pub hardware_addr: String,
    pub tap_name: String,
}

impl Endpoint for TapEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn hardware_addr(&self) -> &str {
        &self.hardware_addr
    }

    fn tap_name(&self) -> &str {
        &self.tap_name
    }
}

/// A block device backed by a host file or device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDrive {
    /// Drive id used when the drive is declared before boot
    pub id: String,
    /// Host path backing the drive
    pub file: PathBuf,
    /// Runtime-wide block index; selects the pool slot on hotplug
    pub index: usize,
}

/// A vsock device.
///
/// The vhost fd cannot be passed over the REST API, so the driver closes it
/// right after declaring the device.
#[derive(Debug)]
pub struct VsockDevice {
    pub context_id: u32,
    pub vhost_fd: OwnedFd,
}

/// A device handed to the driver.
#[derive(Debug)]
pub enum Device {
    Network(Arc<dyn Endpoint>),
    Block(BlockDrive),
    Vsock(VsockDevice),
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::Network(_) => DeviceType::Network,
            Device::Block(_) => DeviceType::Block,
            Device::Vsock(_) => DeviceType::Vsock,
        }
    }
}

/// A device waiting for the API to come up.
#[derive(Debug)]
pub struct PendingDevice {
    pub device: Device,
    pub device_type: DeviceType,
}

impl Firecracker {
    /// Add a device to the VM configuration.
    ///
    /// Before the API is reachable the device is queued and applied during
    /// boot; that is not an error. Afterwards it is sent immediately.
    pub async fn add_device(&self, device: Device) -> Result<()> {
        let readiness = self.readiness.read().await;

        if *readiness == VmmState::NotReady {
            let device_type = device.device_type();
            tracing::info!(sandbox_id = %self.id, %device_type, "FC not ready, queueing device");
            self.pending.lock().await.push(PendingDevice {
                device,
                device_type,
            });
            return Ok(());
        }

        let api = self.client().await;
        dispatch(api.as_ref(), device).await
    }

    /// Hotplug a device into a running (or configured) VM.
    ///
    /// Only block devices are supported: the drive's index picks a
    /// preallocated pool slot whose backing path is replaced. A rescan is
    /// requested when the guest is running so it notices the new size.
    pub async fn hotplug_add_device(&self, device: Device) -> Result<()> {
        let drive = match device {
            Device::Block(drive) => drive,
            other => {
                let device_type = other.device_type();
                tracing::warn!(sandbox_id = %self.id, %device_type, "hotplug_add_device: unsupported device");
                return Err(HypervisorError::UnsupportedDevice(format!(
                    "hotplug of {device_type} devices"
                )));
            }
        };

        let drive_id = self.pool_slot(drive.index).await?;
        tracing::info!(
            sandbox_id = %self.id,
            drive_id = %drive_id,
            path = %drive.file.display(),
            "Updating block drive"
        );

        let api = self.client().await;
        api.patch_drive(&PartialDrive {
            drive_id: drive_id.clone(),
            path_on_host: drive.file,
        })
        .await?;

        if vm_running(api.as_ref()).await {
            api.create_action(&InstanceActionInfo::block_device_rescan(&drive_id))
                .await?;
            tracing::debug!(sandbox_id = %self.id, drive_id = %drive_id, "Block device rescan requested");
        }

        Ok(())
    }

    /// Hot-unplug a device. Firecracker cannot remove devices; this is a no-op.
    pub async fn hotplug_remove_device(&self, device: Device) -> Result<()> {
        tracing::debug!(
            sandbox_id = %self.id,
            device_type = %device.device_type(),
            "hotplug_remove_device: ignored"
        );
        Ok(())
    }

    /// Dispatch every queued device in insertion order.
    pub(crate) async fn flush_pending_devices(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock().await);
        if pending.is_empty() {
            return Ok(());
        }

        tracing::debug!(sandbox_id = %self.id, count = pending.len(), "Adding queued devices");
        let api = self.client().await;
        for entry in pending {
            tracing::trace!(sandbox_id = %self.id, device_type = %entry.device_type, "Flushing queued device");
            dispatch(api.as_ref(), entry.device).await?;
        }
        Ok(())
    }

    /// Pool slot id for a runtime block index.
    async fn pool_slot(&self, index: usize) -> Result<String> {
        self.disk_pool
            .lock()
            .await
            .get(index)
            .cloned()
            .ok_or_else(|| {
                HypervisorError::UnsupportedDevice(format!(
                    "block index {index} outside the preallocated pool of {}",
                    disk_pool::DISK_POOL_SIZE
                ))
            })
    }
}

/// Send one device to the API.
async fn dispatch(api: &dyn ControlApi, device: Device) -> Result<()> {
    match device {
        Device::Network(endpoint) => {
            tracing::info!(endpoint = ?endpoint, "Adding network device");
            let hardware_addr = endpoint.hardware_addr();
            api.put_network_interface(&NetworkInterface {
                iface_id: endpoint.name().to_string(),
                host_dev_name: endpoint.tap_name().to_string(),
                guest_mac: (!hardware_addr.is_empty()).then(|| hardware_addr.to_string()),
                allow_mmds_requests: false,
            })
            .await
        }
        Device::Block(drive) => {
            tracing::info!(drive_id = %drive.id, path = %drive.file.display(), "Adding block device");
            api.put_drive(&Drive {
                drive_id: drive.id,
                path_on_host: drive.file,
                is_root_device: false,
                is_read_only: false,
            })
            .await
        }
        Device::Vsock(vsock) => {
            tracing::info!(context_id = vsock.context_id, "Adding vsock device");
            let result = api
                .put_vsock(&Vsock {
                    vsock_id: VSOCK_ID.to_string(),
                    guest_cid: vsock.context_id,
                })
                .await;
            // Still racy: the fd number can be reused before Firecracker has
            // opened its own vhost device for this context id.
            drop(vsock.vhost_fd);
            result
        }
    }
}

/// Whether the API reports a running guest. Errors count as not running.
pub(crate) async fn vm_running(api: &dyn ControlApi) -> bool {
    match api.describe_instance().await {
        Ok(info) => {
            if info.state == InstanceState::Starting {
                tracing::debug!(state = %info.state, "vm_running: unexpected state");
            }
            info.is_running()
        }
        Err(_) => false,
    }
}
