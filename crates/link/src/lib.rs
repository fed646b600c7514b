//! Link manager for SashLink window actuators.
//!
//! Connects to one bonded peripheral at a time, binds its control
//! characteristic, and exposes a command channel for open/close writes.
//! The wireless stack sits behind the [`Transport`] trait; enable the
//! `btleplug` feature for the platform implementation.

#[cfg(feature = "btleplug")]
pub mod btle;
pub mod capability;
pub mod channel;
pub mod error;
pub mod manager;
pub mod registry;
mod session;
pub mod sim;
pub mod transport;
pub mod types;

#[cfg(feature = "btleplug")]
pub use btle::BtleTransport;
pub use capability::{AlwaysGranted, Capability, CapabilityGuard, RevocableCapability};
pub use channel::{CommandChannel, Submitted};
pub use error::{CommandError, LinkError, RegistryError, TransportError};
pub use manager::LinkManager;
pub use registry::DeviceRegistry;
pub use sim::SimulatedTransport;
pub use transport::{BondSource, Transport, TransportFuture};
pub use types::{
    BondedPeripheral, CharacteristicHandle, FailureReason, LinkState, PeripheralRef, ServiceMap,
    TransportSignal, WriteMode,
};
