//! Bonded device registry.

use std::sync::Arc;

use tracing::debug;

use crate::capability::Capability;
use crate::error::RegistryError;
use crate::transport::BondSource;
use crate::types::PeripheralRef;

/// Display name used for bonded peripherals that report no name.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Lists peripherals the platform has already bonded with.
///
/// Every call re-reads the platform list; nothing is cached.
pub struct DeviceRegistry {
    source: Arc<dyn BondSource>,
    capability: Capability,
}

impl DeviceRegistry {
    pub fn new(source: Arc<dyn BondSource>, capability: Capability) -> Self {
        Self { source, capability }
    }

    /// Returns the bonded peripherals. An empty list is a valid result.
    pub async fn list_bonded(&self) -> Result<Vec<PeripheralRef>, RegistryError> {
        if !self.capability.is_granted("list_bonded") {
            return Err(RegistryError::PermissionDenied);
        }

        let bonded = self.source.bonded().await?;
        let peripherals: Vec<PeripheralRef> = bonded
            .into_iter()
            .map(|b| PeripheralRef {
                display_name: b
                    .name
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| UNKNOWN_NAME.to_string()),
                address: b.address,
            })
            .collect();

        debug!(count = peripherals.len(), "listed bonded peripherals");
        Ok(peripherals)
    }

    /// Finds a bonded peripheral by address (case-insensitive).
    pub async fn find(&self, address: &str) -> Result<Option<PeripheralRef>, RegistryError> {
        let address = address.trim();
        Ok(self
            .list_bonded()
            .await?
            .into_iter()
            .find(|p| p.address.eq_ignore_ascii_case(address)))
    }
}
