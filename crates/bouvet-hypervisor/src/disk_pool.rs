//! Placeholder drives declared before boot.
//!
//! Firecracker cannot attach a new drive to a running guest. It can only
//! change the backing file of a drive it already knows and rescan it. A
//! fixed pool of empty drives is therefore declared before the guest starts,
//! and hotplugged block devices take over a slot by index.

use crate::api::ControlApi;
use crate::error::Result;
use crate::models::Drive;
use crate::store::SandboxStore;

/// Number of block devices that can be hotplugged into a guest.
pub const DISK_POOL_SIZE: usize = 8;

/// Drive id of pool slot `index`.
pub fn drive_id(index: usize) -> String {
    format!("drive_{index}")
}

/// Declare [`DISK_POOL_SIZE`] writable placeholder drives, each backed by a
/// fresh scratch file. Returns the slot ids in index order.
pub async fn preallocate(api: &dyn ControlApi, store: &dyn SandboxStore) -> Result<Vec<String>> {
    let mut slots = Vec::with_capacity(DISK_POOL_SIZE);

    for index in 0..DISK_POOL_SIZE {
        let id = drive_id(index);
        let path_on_host = store.scratch_file()?;
        tracing::trace!(drive_id = %id, path = %path_on_host.display(), "Declaring placeholder drive");

        api.put_drive(&Drive {
            drive_id: id.clone(),
            path_on_host,
            is_root_device: false,
            is_read_only: false,
        })
        .await?;
        slots.push(id);
    }

    tracing::debug!(size = DISK_POOL_SIZE, "Disk pool created");
    Ok(slots)
}
