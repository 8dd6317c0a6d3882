//! Persistence of driver metadata across runtime restarts.

use crate::error::{HypervisorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Items a store keeps for a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreItem {
    /// Hypervisor metadata ([`HypervisorInfo`])
    Hypervisor,
}

impl StoreItem {
    fn file_name(self) -> &'static str {
        match self {
            StoreItem::Hypervisor => "hypervisor.json",
        }
    }
}

impl fmt::Display for StoreItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreItem::Hypervisor => write!(f, "Hypervisor"),
        }
    }
}

/// Hypervisor information kept on disk so a restarted runtime can find the
/// VMM again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorInfo {
    pub pid: u32,
}

/// Per-sandbox storage used by the driver.
pub trait SandboxStore: Send + Sync {
    /// Read `item`. A missing item is an error the caller may ignore.
    fn load(&self, item: StoreItem) -> Result<Vec<u8>>;

    /// Write `item`, replacing any previous content.
    fn store(&self, item: StoreItem, data: &[u8]) -> Result<()>;

    /// Allocate a new empty file and return its path.
    fn scratch_file(&self) -> Result<PathBuf>;
}

/// [`SandboxStore`] keeping items as files under a root directory.
///
/// ```text
/// <root>/hypervisor.json
/// <root>/raw/<uuid>          scratch files
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            HypervisorError::Persistence(format!("failed to create {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SandboxStore for FileStore {
    fn load(&self, item: StoreItem) -> Result<Vec<u8>> {
        let path = self.root.join(item.file_name());
        fs::read(&path).map_err(|e| {
            HypervisorError::Persistence(format!("failed to load {item} from {}: {e}", path.display()))
        })
    }

    fn store(&self, item: StoreItem, data: &[u8]) -> Result<()> {
        let path = self.root.join(item.file_name());
        // Write then rename so a crash never leaves a truncated record
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                HypervisorError::Persistence(format!("failed to store {item} to {}: {e}", path.display()))
            })
    }

    fn scratch_file(&self) -> Result<PathBuf> {
        let dir = self.root.join("raw");
        let path = dir.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)
            .and_then(|_| fs::File::create(&path))
            .map_err(|e| {
                HypervisorError::Persistence(format!("failed to create scratch file {}: {e}", path.display()))
            })?;
        Ok(path)
    }
}
