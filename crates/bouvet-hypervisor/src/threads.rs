//! Locating the host threads that run guest vCPUs.
//!
//! Firecracker names each vCPU thread `fc_vcpu <n>`. The mapping from vCPU
//! index to thread id is used by the runtime to place vCPUs in cgroups.

use crate::error::{HypervisorError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Thread name prefix of Firecracker vCPU threads.
pub const VCPU_THREAD_PREFIX: &str = "fc_vcpu";

/// vCPU index to host thread id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuThreadIds {
    pub vcpus: HashMap<u32, u32>,
}

/// Read the vCPU threads of the process `pid` from `/proc`.
pub fn vcpu_thread_ids(pid: u32) -> Result<VcpuThreadIds> {
    vcpu_thread_ids_in(Path::new("/proc"), pid)
}

/// Like [`vcpu_thread_ids`], reading from a proc filesystem mounted at
/// `proc_root`.
///
/// Any unreadable thread name or malformed vCPU suffix fails the whole
/// lookup: a partial map would silently leave vCPUs unplaced.
pub fn vcpu_thread_ids_in(proc_root: &Path, pid: u32) -> Result<VcpuThreadIds> {
    let task_dir = proc_root.join(pid.to_string()).join("task");
    let entries = fs::read_dir(&task_dir).map_err(|e| {
        HypervisorError::ThreadInfo(format!("cannot list {}: {e}", task_dir.display()))
    })?;

    let mut ids = VcpuThreadIds::default();
    for entry in entries {
        let entry = entry.map_err(|e| {
            HypervisorError::ThreadInfo(format!("cannot read {}: {e}", task_dir.display()))
        })?;
        let file_name = entry.file_name();
        let Some(tid) = file_name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let comm = fs::read_to_string(entry.path().join("comm"))
            .map_err(|e| HypervisorError::ThreadInfo(format!("thread {tid}: {e}")))?;
        let comm = comm.trim_end_matches('\n');

        let Some(suffix) = comm.strip_prefix(VCPU_THREAD_PREFIX) else {
            continue;
        };
        let index = suffix
            .trim()
            .parse::<u32>()
            .map_err(|e| HypervisorError::ThreadInfo(format!("{comm}: {e}")))?;
        ids.vcpus.insert(index, tid);
    }

    tracing::debug!(pid, vcpus = ids.vcpus.len(), "Located vCPU threads");
    Ok(ids)
}
