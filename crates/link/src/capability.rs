//! Connect-capability guard.
//!
//! The operating environment can revoke Bluetooth access at any time, so the
//! guard is consulted right before every transport call instead of caching a
//! previous answer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// Source of truth for the connect permission.
pub trait CapabilityGuard: Send + Sync {
    /// Returns whether the connect permission is held right now.
    fn connect_granted(&self) -> bool;
}

/// Guard for platforms without a runtime permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl CapabilityGuard for AlwaysGranted {
    fn connect_granted(&self) -> bool {
        true
    }
}

/// A permission flag that can be granted and revoked at runtime.
#[derive(Debug, Clone)]
pub struct RevocableCapability {
    granted: Arc<AtomicBool>,
}

impl RevocableCapability {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(granted)),
        }
    }

    pub fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }

    pub fn revoke(&self) {
        self.granted.store(false, Ordering::SeqCst);
    }
}

impl CapabilityGuard for RevocableCapability {
    fn connect_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

/// Shared handle to a [`CapabilityGuard`].
#[derive(Clone)]
pub struct Capability(Arc<dyn CapabilityGuard>);

impl Capability {
    pub fn new(guard: impl CapabilityGuard + 'static) -> Self {
        Self(Arc::new(guard))
    }

    /// A capability that is always held.
    pub fn always() -> Self {
        Self::new(AlwaysGranted)
    }

    /// Checks the permission. Call immediately before the guarded operation.
    pub fn is_granted(&self, operation: &str) -> bool {
        let granted = self.0.connect_granted();
        if !granted {
            debug!(operation, "connect capability not held");
        }
        granted
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Capability")
            .field(&self.0.connect_granted())
            .finish()
    }
}
