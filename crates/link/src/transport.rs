//! Transport boundary consumed by the link manager and device registry.
//!
//! Implemented by the platform Bluetooth stack (see the `btleplug` feature)
//! and by [`SimulatedTransport`](crate::sim::SimulatedTransport) for tests.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::{BondedPeripheral, CharacteristicHandle, ServiceMap, TransportSignal, WriteMode};

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Link-layer operations on a single peripheral.
pub trait Transport: Send + Sync {
    /// Starts a connection to `address`.
    ///
    /// Resolves as soon as the request is queued; link-up and link-down are
    /// reported later on the returned channel. A closed channel counts as
    /// link-down.
    fn open(&self, address: &str) -> TransportFuture<'_, mpsc::Receiver<TransportSignal>>;

    /// Discovers services and characteristics on a connected peripheral.
    fn discover(&self, address: &str) -> TransportFuture<'_, ServiceMap>;

    /// Submits a write to a bound characteristic.
    ///
    /// With [`WriteMode::WithoutResponse`] success only means the local stack
    /// accepted the request.
    fn write(
        &self,
        handle: &CharacteristicHandle,
        payload: &[u8],
        mode: WriteMode,
    ) -> TransportFuture<'_, ()>;

    /// Tears down whatever the transport holds for `address`.
    fn release(&self, address: &str) -> TransportFuture<'_, ()>;
}

/// Read-only view of the platform bonding list.
pub trait BondSource: Send + Sync {
    fn bonded(&self) -> TransportFuture<'_, Vec<BondedPeripheral>>;
}
