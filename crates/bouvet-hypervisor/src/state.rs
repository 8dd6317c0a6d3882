//! Readiness of the VMM/guest pair.

use crate::error::{HypervisorError, Result};
use std::fmt;
use std::ops::Deref;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Lifecycle stage of a Firecracker instance.
///
/// Ordered: a run only ever moves forward until [`Readiness::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum VmmState {
    /// No API to talk to yet
    #[default]
    NotReady,
    /// The VMM process answers on its API socket
    ApiReady,
    /// The guest start action was accepted
    VmReady,
}

impl fmt::Display for VmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmState::NotReady => write!(f, "FC not ready"),
            VmmState::ApiReady => write!(f, "FC API ready"),
            VmmState::VmReady => write!(f, "FC VM ready"),
        }
    }
}

/// Readiness state owned by one hypervisor instance.
#[derive(Debug, Default)]
pub struct Readiness {
    state: RwLock<VmmState>,
}

/// Shared view of the readiness state.
///
/// Transitions wait until every view is dropped, so the state seen through
/// a view holds for as long as it lives.
pub struct ReadinessView<'a> {
    guard: RwLockReadGuard<'a, VmmState>,
}

impl Deref for ReadinessView<'_> {
    type Target = VmmState;

    fn deref(&self) -> &VmmState {
        &self.guard
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub async fn get(&self) -> VmmState {
        *self.state.read().await
    }

    /// Pin the current state until the returned view is dropped.
    pub async fn read(&self) -> ReadinessView<'_> {
        ReadinessView {
            guard: self.state.read().await,
        }
    }

    /// Move forward to `to`. Moving backwards is rejected.
    pub async fn transition(&self, to: VmmState) -> Result<()> {
        let mut state = self.state.write().await;
        if to < *state {
            return Err(HypervisorError::InvalidState {
                expected: format!("at most {to}"),
                actual: state.to_string(),
            });
        }
        tracing::debug!(from = %*state, to = %to, "Readiness transition");
        *state = to;
        Ok(())
    }

    /// Force the state back to [`VmmState::NotReady`].
    pub async fn disconnect(&self) {
        let mut state = self.state.write().await;
        tracing::debug!(from = %*state, "Readiness reset");
        *state = VmmState::NotReady;
    }
}
