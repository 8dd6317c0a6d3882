//! Error types for bouvet-hypervisor.

use crate::boot::BootStep;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for bouvet-hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Errors that can occur while driving a Firecracker instance.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The Firecracker process could not be launched
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        /// Executable that failed to launch
        path: PathBuf,
        /// Underlying launch error
        #[source]
        source: std::io::Error,
    },

    /// The API socket is unreachable or the exchange failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Firecracker answered with a non-success status
    #[error("API request {request} failed with status {status}: {body}")]
    Api {
        /// Method and path of the failed request
        request: String,
        /// HTTP status code
        status: u16,
        /// Response body (Firecracker's fault message)
        body: String,
    },

    /// A bounded wait ran out
    #[error("timed out after {timeout:?}: {last_error}")]
    Timeout {
        /// Bound that was exceeded
        timeout: Duration,
        /// Failure observed on the final poll
        last_error: Box<HypervisorError>,
    },

    /// Configuration error (bad timeout, missing asset, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Device class or pool index this backend cannot hotplug
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Readiness is not in the expected state
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// A boot step failed; `cleanup` holds the outcome of killing the VMM
    #[error("boot failed at {step}: {source}")]
    Boot {
        /// Step that failed
        step: BootStep,
        /// Why it failed
        #[source]
        source: Box<HypervisorError>,
        /// Error from the termination that followed, if it failed too
        cleanup: Option<Box<HypervisorError>>,
    },

    /// Persistence store failure
    #[error("store error: {0}")]
    Persistence(String),

    /// Malformed or unreadable thread information under /proc
    #[error("invalid fc thread info: {0}")]
    ThreadInfo(String),

    /// Signal delivery failed
    #[error("signal error: {0}")]
    Signal(#[from] nix::errno::Errno),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HypervisorError {
    /// Wrap `source` as the failure of boot step `step`.
    pub(crate) fn boot(step: BootStep, source: HypervisorError) -> Self {
        Self::Boot {
            step,
            source: Box::new(source),
            cleanup: None,
        }
    }

    /// The boot step that failed, if this is a boot error.
    pub fn boot_step(&self) -> Option<BootStep> {
        match self {
            Self::Boot { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Check if this error is a timeout, including a boot step that timed out.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Boot { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}
