//! Hypervisor configuration and kernel command line assembly.

use crate::error::{HypervisorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum time to wait for the Firecracker API to answer after spawn.
pub const API_READY_TIMEOUT_SECS: i64 = 10;

/// Grace period between SIGTERM and SIGKILL when stopping a sandbox.
pub const STOP_SANDBOX_TIMEOUT: Duration = Duration::from_secs(15);

/// Name of the API socket inside the sandbox run directory.
pub const API_SOCKET_NAME: &str = "firecracker.sock";

/// A single kernel command line parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name
    pub key: String,
    /// Parameter value (empty for bare flags such as `quiet`)
    pub value: String,
}

impl Param {
    /// Create a parameter from a key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a `key=value` token. A token without `=` becomes a bare flag.
    pub fn parse(token: &str) -> Self {
        match token.split_once('=') {
            Some((key, value)) => Self::new(key, value),
            None => Self::new(token, ""),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}={}", self.key, self.value)
        }
    }
}

/// Parameters every Firecracker guest is booted with.
///
/// The root parameters point at the first partition of the first block
/// device, which is the `rootfs` drive declared during boot. Firecracker has
/// no ACPI or PCI, and a guest panic must reboot (i.e. exit the VMM).
pub fn backend_kernel_params() -> Vec<Param> {
    vec![
        Param::new("root", "/dev/vda1"),
        Param::new("rootflags", "data=ordered,errors=remount-ro ro"),
        Param::new("rootfstype", "ext4"),
        Param::new("pci", "off"),
        Param::new("reboot", "k"),
        Param::new("panic", "1"),
        Param::new("iommu", "off"),
        Param::new("8250.nr_uarts", "0"),
        Param::new("net.ifnames", "0"),
        Param::new("random.trust_cpu", "on"),
        Param::new("acpi", "off"),
    ]
}

/// Build the guest command line: caller parameters first, backend
/// parameters last so they win under last-write-wins parsing.
pub fn kernel_cmdline(caller: &[Param]) -> String {
    caller
        .iter()
        .cloned()
        .chain(backend_kernel_params())
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Configuration for one Firecracker-backed sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Path to the Firecracker binary
    pub hypervisor_path: PathBuf,
    /// Path to the guest kernel image
    pub kernel_path: PathBuf,
    /// Initrd image used as the guest root filesystem (preferred)
    pub initrd_path: Option<PathBuf>,
    /// Root filesystem image, used when no initrd is configured
    pub image_path: Option<PathBuf>,
    /// Extra kernel parameters supplied by the caller
    pub kernel_params: Vec<Param>,
    /// Memory size in MiB
    pub memory_mib: u32,
    /// Number of virtual CPUs
    pub vcpu_count: u32,
    /// Directory holding per-sandbox API sockets and state
    pub run_dir: PathBuf,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            hypervisor_path: PathBuf::from("/usr/local/bin/firecracker"),
            kernel_path: PathBuf::from("/var/lib/bouvet/vmlinux"),
            initrd_path: None,
            image_path: Some(PathBuf::from("/var/lib/bouvet/debian-devbox.ext4")),
            kernel_params: Vec::new(),
            memory_mib: 256,
            vcpu_count: 2,
            run_dir: PathBuf::from("/tmp/bouvet"),
        }
    }
}

impl HypervisorConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `BOUVET_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `BOUVET_KERNEL` | `/var/lib/bouvet/vmlinux` |
    /// | `BOUVET_INITRD` | unset |
    /// | `BOUVET_ROOTFS` | `/var/lib/bouvet/debian-devbox.ext4` |
    /// | `BOUVET_KERNEL_PARAMS` | empty (space separated `key=value`) |
    /// | `BOUVET_MEMORY_MIB` | `256` |
    /// | `BOUVET_VCPUS` | `2` |
    /// | `BOUVET_RUN_DIR` | `/tmp/bouvet` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        Self {
            hypervisor_path: lookup("BOUVET_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.hypervisor_path),
            kernel_path: lookup("BOUVET_KERNEL")
                .map(PathBuf::from)
                .unwrap_or(default.kernel_path),
            initrd_path: lookup("BOUVET_INITRD")
                .map(PathBuf::from)
                .or(default.initrd_path),
            image_path: lookup("BOUVET_ROOTFS")
                .map(PathBuf::from)
                .or(default.image_path),
            kernel_params: lookup("BOUVET_KERNEL_PARAMS")
                .map(|v| v.split_whitespace().map(Param::parse).collect())
                .unwrap_or(default.kernel_params),
            memory_mib: lookup("BOUVET_MEMORY_MIB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.memory_mib),
            vcpu_count: lookup("BOUVET_VCPUS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.vcpu_count),
            run_dir: lookup("BOUVET_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.run_dir),
        }
    }

    /// API socket path for the sandbox `id`.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.sandbox_dir(id).join(API_SOCKET_NAME)
    }

    /// Per-sandbox state directory.
    pub fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.run_dir.join(id)
    }

    /// Kernel image path.
    pub fn kernel_asset_path(&self) -> Result<PathBuf> {
        non_empty(&self.kernel_path)
            .ok_or_else(|| HypervisorError::Config("kernel asset path not found".into()))
    }

    /// Initrd path, if one is configured.
    pub fn initrd_asset_path(&self) -> Option<PathBuf> {
        self.initrd_path.as_deref().and_then(non_empty)
    }

    /// Root filesystem image path.
    pub fn image_asset_path(&self) -> Result<PathBuf> {
        self.image_path
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| HypervisorError::Config("image asset path not found".into()))
    }

    /// Guest root filesystem: the initrd when present, else the image.
    pub fn rootfs_asset_path(&self) -> Result<PathBuf> {
        match self.initrd_asset_path() {
            Some(path) => Ok(path),
            None => self.image_asset_path(),
        }
    }
}

fn non_empty(path: &Path) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then(|| path.to_path_buf())
}
