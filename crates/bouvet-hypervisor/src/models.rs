//! Request and response bodies of the Firecracker API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// `PUT /machine-config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfiguration {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub ht_enabled: bool,
}

/// `PUT /boot-source`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

/// `PUT /drives/{drive_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// `PATCH /drives/{drive_id}`. Only the backing path can change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDrive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
}

/// `PUT /network-interfaces/{iface_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    pub allow_mmds_requests: bool,
}

/// `PUT /vsock`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vsock {
    pub vsock_id: String,
    pub guest_cid: u32,
}

/// Synchronous actions accepted by `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    InstanceStart,
    BlockDeviceRescan,
}

/// `PUT /actions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl InstanceActionInfo {
    /// Boot the configured guest.
    pub fn instance_start() -> Self {
        Self {
            action_type: ActionType::InstanceStart,
            payload: None,
        }
    }

    /// Ask the guest to re-read the geometry of `drive_id`.
    pub fn block_device_rescan(drive_id: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::BlockDeviceRescan,
            payload: Some(drive_id.into()),
        }
    }
}

/// Instance state reported by `GET /`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    Uninitialized,
    Starting,
    Running,
    Halting,
    Halted,
    /// A state string this driver does not know about
    Other(String),
}

impl From<String> for InstanceState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Uninitialized" | "Not started" => Self::Uninitialized,
            "Starting" => Self::Starting,
            "Running" => Self::Running,
            "Halting" => Self::Halting,
            "Halted" => Self::Halted,
            _ => Self::Other(s),
        }
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Halting => write!(f, "Halting"),
            Self::Halted => write!(f, "Halted"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// `GET /` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    #[serde(default)]
    pub id: Option<String>,
    pub state: InstanceState,
}

impl InstanceInfo {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}
