//! Link session state machine.
//!
//! All state changes go through [`LinkSession::apply`], which is pure: it
//! performs no I/O and tells the caller which follow-up action to run.

use sashlink_protocol::{CONTROL_CHAR_UUID, SERVICE_UUID};
use tracing::{debug, trace, warn};

use crate::error::{LinkError, TransportError};
use crate::types::{CharacteristicHandle, FailureReason, LinkState, ServiceMap, TransportSignal};

/// Internal phase. The bound handle lives inside `Ready`, so state and
/// handle can only change together.
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Connecting,
    LinkEstablished,
    Discovering,
    Ready(CharacteristicHandle),
    Disconnected,
    Failed(FailureReason),
}

/// Inputs accepted by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionInput {
    LinkUp,
    LinkDown,
    /// The transport refused to start the connection.
    OpenFailed(TransportError),
    DiscoveryStarted,
    /// Discovery was due but the connect capability is no longer held.
    DiscoveryBlocked,
    ServicesDiscovered(ServiceMap),
    DiscoveryFailed(TransportError),
}

impl From<TransportSignal> for SessionInput {
    fn from(signal: TransportSignal) -> Self {
        match signal {
            TransportSignal::LinkUp => Self::LinkUp,
            TransportSignal::LinkDown => Self::LinkDown,
        }
    }
}

/// Follow-up requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionAction {
    BeginDiscovery,
}

/// One attempt to talk to one peripheral.
#[derive(Debug)]
pub(crate) struct LinkSession {
    address: Option<String>,
    generation: u64,
    phase: Phase,
    last_error: Option<LinkError>,
    transport_held: bool,
}

impl LinkSession {
    pub(crate) fn idle() -> Self {
        Self {
            address: None,
            generation: 0,
            phase: Phase::Idle,
            last_error: None,
            transport_held: false,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        match &self.phase {
            Phase::Idle => LinkState::Idle,
            Phase::Connecting => LinkState::Connecting,
            Phase::LinkEstablished => LinkState::LinkEstablished,
            Phase::Discovering => LinkState::Discovering,
            Phase::Ready(_) => LinkState::Ready,
            Phase::Disconnected => LinkState::Disconnected,
            Phase::Failed(reason) => LinkState::Failed(*reason),
        }
    }

    pub(crate) fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn last_error(&self) -> Option<&LinkError> {
        self.last_error.as_ref()
    }

    /// The bound characteristic, present only in `Ready`.
    pub(crate) fn handle(&self) -> Option<&CharacteristicHandle> {
        match &self.phase {
            Phase::Ready(handle) => Some(handle),
            _ => None,
        }
    }

    /// Starts a fresh session for `address` and returns its generation.
    ///
    /// The transport is considered held from here until [`take_transport`]
    /// hands it back for release.
    ///
    /// [`take_transport`]: Self::take_transport
    pub(crate) fn begin(&mut self, address: &str) -> u64 {
        self.generation += 1;
        self.address = Some(address.to_string());
        self.phase = Phase::Connecting;
        self.last_error = None;
        self.transport_held = true;
        self.generation
    }

    /// Returns true exactly once per begun session, when the transport
    /// still needs releasing.
    pub(crate) fn take_transport(&mut self) -> bool {
        std::mem::take(&mut self.transport_held)
    }

    /// Drops the session and returns to `Idle`. The generation counter is kept
    /// so late events from the old session are still recognised as stale.
    pub(crate) fn reset(&mut self) {
        self.address = None;
        self.phase = Phase::Idle;
        self.last_error = None;
        self.transport_held = false;
    }

    /// Applies one input and returns the follow-up action, if any.
    pub(crate) fn apply(&mut self, input: SessionInput) -> Option<SessionAction> {
        let from = self.state();
        let action = match (from, input) {
            (LinkState::Idle, input) => {
                trace!(?input, "input ignored without a session");
                None
            }
            (LinkState::Connecting, SessionInput::LinkUp) => {
                self.phase = Phase::LinkEstablished;
                Some(SessionAction::BeginDiscovery)
            }
            (LinkState::Connecting, SessionInput::OpenFailed(e)) => {
                self.phase = Phase::Disconnected;
                self.last_error = Some(LinkError::Transport(e));
                None
            }
            (LinkState::Disconnected, SessionInput::LinkDown) => None,
            (LinkState::Failed(_), SessionInput::LinkDown) => {
                // The failure reason stays the more useful error.
                self.phase = Phase::Disconnected;
                None
            }
            (_, SessionInput::LinkDown) => {
                self.phase = Phase::Disconnected;
                self.last_error = Some(LinkError::LinkDown);
                None
            }
            (LinkState::LinkEstablished, SessionInput::DiscoveryStarted) => {
                self.phase = Phase::Discovering;
                None
            }
            (LinkState::LinkEstablished, SessionInput::DiscoveryBlocked) => {
                self.last_error = Some(LinkError::PermissionDenied);
                None
            }
            (LinkState::Discovering, SessionInput::ServicesDiscovered(services)) => {
                self.bind(&services);
                None
            }
            (LinkState::Discovering, SessionInput::DiscoveryFailed(e)) => {
                warn!(address = ?self.address, error = %e, "service discovery failed");
                self.phase = Phase::Failed(FailureReason::DiscoveryFailed);
                self.last_error = Some(LinkError::Transport(e));
                None
            }
            (_, input) => {
                trace!(state = ?from, ?input, "input not valid in this state");
                None
            }
        };

        let to = self.state();
        if from != to {
            debug!(address = ?self.address, generation = self.generation, ?from, ?to, "link state changed");
        }
        action
    }

    fn bind(&mut self, services: &ServiceMap) {
        if !services.contains(&SERVICE_UUID, &CONTROL_CHAR_UUID) {
            warn!(
                address = ?self.address,
                service_present = services.has_service(&SERVICE_UUID),
                "control characteristic missing"
            );
            self.phase = Phase::Failed(FailureReason::ProtocolMismatch);
            self.last_error = Some(LinkError::ProtocolMismatch);
            return;
        }

        self.phase = Phase::Ready(CharacteristicHandle {
            address: self.address.clone().unwrap_or_default(),
            service: SERVICE_UUID,
            characteristic: CONTROL_CHAR_UUID,
            generation: self.generation,
        });
    }
}
