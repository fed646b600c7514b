//! Public types for the link manager.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

/// A previously bonded peripheral as listed by the device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralRef {
    pub display_name: String,
    pub address: String,
}

/// Raw bonding entry reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedPeripheral {
    pub name: Option<String>,
    pub address: String,
}

impl BondedPeripheral {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.to_string(),
        }
    }
}

/// Why a session ended up in [`LinkState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The peripheral does not expose the control service/characteristic.
    ProtocolMismatch,
    /// Service discovery itself failed at the transport level.
    DiscoveryFailed,
}

/// Observable state of the current link session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session.
    Idle,
    /// Link-layer connection requested, waiting for the transport.
    Connecting,
    /// Link is up; discovery has not started yet.
    LinkEstablished,
    /// Service discovery in progress.
    Discovering,
    /// Control characteristic bound; commands can be sent.
    Ready,
    /// Link dropped. Retry with a fresh `connect`.
    Disconnected,
    /// Session cannot make progress.
    Failed(FailureReason),
}

impl LinkState {
    /// Returns true while the session is heading towards, or in, `Ready`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::LinkEstablished | Self::Discovering | Self::Ready
        )
    }

    /// Stable lowercase label, used as the mirrored link state value.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::LinkEstablished => "connected",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed(FailureReason::ProtocolMismatch) => "protocol_mismatch",
            Self::Failed(FailureReason::DiscoveryFailed) => "discovery_failed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Connecting => f.write_str("Connecting..."),
            Self::LinkEstablished => f.write_str("Connected"),
            Self::Discovering => f.write_str("Discovering services..."),
            Self::Ready => f.write_str("Ready"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Failed(FailureReason::ProtocolMismatch) => {
                f.write_str("Failed: peripheral does not speak the control protocol")
            }
            Self::Failed(FailureReason::DiscoveryFailed) => {
                f.write_str("Failed: service discovery error")
            }
        }
    }
}

/// Link-layer signal delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    LinkUp,
    LinkDown,
}

/// Write semantics requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    /// Fire-and-forget: the transport only reports local acceptance.
    WithoutResponse,
}

/// Services discovered on a peripheral, keyed by service UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    services: HashMap<Uuid, Vec<Uuid>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service with its characteristics, merging with existing entries.
    pub fn with_service(mut self, service: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        self.insert(service, characteristics);
        self
    }

    pub fn insert(&mut self, service: Uuid, characteristics: impl IntoIterator<Item = Uuid>) {
        let entry = self.services.entry(service).or_default();
        for c in characteristics {
            if !entry.contains(&c) {
                entry.push(c);
            }
        }
    }

    pub fn has_service(&self, service: &Uuid) -> bool {
        self.services.contains_key(service)
    }

    /// Returns true if `characteristic` is listed under `service`.
    pub fn contains(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.services
            .get(service)
            .is_some_and(|chars| chars.contains(characteristic))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

/// A characteristic bound for writing within one session.
///
/// Handles carry the session generation that produced them and are never
/// carried over to a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub address: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(LinkState::Connecting.is_active());
        assert!(LinkState::Ready.is_active());
        assert!(!LinkState::Idle.is_active());
        assert!(!LinkState::Disconnected.is_active());
        assert!(!LinkState::Failed(FailureReason::ProtocolMismatch).is_active());
    }

    #[test]
    fn service_map_lookup() {
        let svc = Uuid::from_u128(1);
        let chr = Uuid::from_u128(2);
        let map = ServiceMap::new().with_service(svc, [chr]);
        assert!(map.has_service(&svc));
        assert!(map.contains(&svc, &chr));
        assert!(!map.contains(&svc, &Uuid::from_u128(3)));
        assert!(!map.contains(&Uuid::from_u128(3), &chr));
    }

    #[test]
    fn service_map_merges_duplicates() {
        let svc = Uuid::from_u128(1);
        let mut map = ServiceMap::new().with_service(svc, [Uuid::from_u128(2)]);
        map.insert(svc, [Uuid::from_u128(2), Uuid::from_u128(3)]);
        assert_eq!(map.len(), 1);
        assert!(map.contains(&svc, &Uuid::from_u128(3)));
    }

    #[test]
    fn labels_are_distinct() {
        let states = [
            LinkState::Idle,
            LinkState::Connecting,
            LinkState::LinkEstablished,
            LinkState::Discovering,
            LinkState::Ready,
            LinkState::Disconnected,
            LinkState::Failed(FailureReason::ProtocolMismatch),
            LinkState::Failed(FailureReason::DiscoveryFailed),
        ];
        let mut labels: Vec<_> = states.iter().map(|s| s.label()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), states.len());
    }
}
