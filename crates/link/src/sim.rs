//! Scriptable in-process transport.
//!
//! Records every open, discovery, write and release, and lets the caller
//! inject link-up/link-down signals and discovery results. Used by the test
//! suites and by the controller's simulated mode.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sashlink_protocol::{CONTROL_CHAR_UUID, SERVICE_UUID};
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::trace;

use crate::error::TransportError;
use crate::transport::{BondSource, Transport, TransportFuture};
use crate::types::{
    BondedPeripheral, CharacteristicHandle, ServiceMap, TransportSignal, WriteMode,
};

/// Capacity of each simulated signal channel.
const SIGNAL_CAPACITY: usize = 16;

/// A write accepted by the simulated transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub handle: CharacteristicHandle,
    pub payload: Vec<u8>,
    pub mode: WriteMode,
}

/// Outcome handed to a simulated discovery.
pub type DiscoveryResult = Result<ServiceMap, TransportError>;

enum PendingDiscovery {
    Resolved(DiscoveryResult),
    Waiting(oneshot::Receiver<DiscoveryResult>),
}

#[derive(Debug)]
enum DiscoveryMode {
    /// Every discovery resolves immediately with this result.
    Immediate(DiscoveryResult),
    /// Discoveries wait for [`SimulatedTransport::finish_discovery`].
    Held {
        waiter: Option<oneshot::Sender<DiscoveryResult>>,
        queued: Option<DiscoveryResult>,
    },
}

#[derive(Debug)]
struct SimState {
    links: HashMap<String, mpsc::Sender<TransportSignal>>,
    auto_link_up: bool,
    open_error: Option<TransportError>,
    write_error: Option<TransportError>,
    bonded_error: Option<TransportError>,
    discovery: DiscoveryMode,
    bonded: Vec<BondedPeripheral>,
    opens: Vec<String>,
    releases: Vec<String>,
    writes: Vec<RecordedWrite>,
    discoveries: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<SimState>,
    changed: Notify,
}

/// In-process [`Transport`] and [`BondSource`].
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    inner: Arc<Inner>,
}

/// Service map of a peripheral that implements the control protocol.
pub fn conforming_services() -> ServiceMap {
    ServiceMap::new().with_service(SERVICE_UUID, [CONTROL_CHAR_UUID])
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// A transport whose links wait for [`link_up`](Self::link_up) and whose
    /// peripherals expose the control characteristic.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SimState {
                    links: HashMap::new(),
                    auto_link_up: false,
                    open_error: None,
                    write_error: None,
                    bonded_error: None,
                    discovery: DiscoveryMode::Immediate(Ok(conforming_services())),
                    bonded: Vec::new(),
                    opens: Vec::new(),
                    releases: Vec::new(),
                    writes: Vec::new(),
                    discoveries: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// A transport where every open links up immediately.
    pub fn auto_connecting() -> Self {
        let sim = Self::new();
        sim.state().auto_link_up = true;
        sim
    }

    pub fn with_bonded(self, bonded: Vec<BondedPeripheral>) -> Self {
        self.set_bonded(bonded);
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_bonded(&self, bonded: Vec<BondedPeripheral>) {
        self.state().bonded = bonded;
    }

    pub fn fail_bonded(&self, error: Option<TransportError>) {
        self.state().bonded_error = error;
    }

    /// Makes the next `open` fail with `error`.
    pub fn fail_next_open(&self, error: TransportError) {
        self.state().open_error = Some(error);
    }

    /// Makes every write fail with `error` until cleared with `None`.
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state().write_error = error;
    }

    /// Resolves every future discovery immediately with `result`.
    pub fn set_discovery(&self, result: DiscoveryResult) {
        self.state().discovery = DiscoveryMode::Immediate(result);
    }

    /// Holds discoveries until [`finish_discovery`](Self::finish_discovery).
    pub fn hold_discovery(&self) {
        self.state().discovery = DiscoveryMode::Held {
            waiter: None,
            queued: None,
        };
    }

    /// Completes a held discovery. If none is pending yet, the result is
    /// queued for the next one. Returns false if the pending discovery was
    /// already abandoned or discoveries are not held.
    pub fn finish_discovery(&self, result: DiscoveryResult) -> bool {
        let mut state = self.state();
        match &mut state.discovery {
            DiscoveryMode::Held { waiter, queued } => match waiter.take() {
                Some(tx) => tx.send(result).is_ok(),
                None => {
                    *queued = Some(result);
                    true
                }
            },
            DiscoveryMode::Immediate(_) => false,
        }
    }

    /// Delivers link-up to the open link for `address`.
    pub fn link_up(&self, address: &str) -> bool {
        self.signal(address, TransportSignal::LinkUp)
    }

    /// Delivers link-down to the open link for `address`.
    pub fn link_down(&self, address: &str) -> bool {
        self.signal(address, TransportSignal::LinkDown)
    }

    /// Closes the signal stream for `address` without a link-down.
    pub fn drop_link(&self, address: &str) -> bool {
        self.state().links.remove(&key(address)).is_some()
    }

    fn signal(&self, address: &str, signal: TransportSignal) -> bool {
        let tx = self.state().links.get(&key(address)).cloned();
        match tx {
            Some(tx) => tx.try_send(signal).is_ok(),
            None => {
                trace!(address, ?signal, "no open link for simulated signal");
                false
            }
        }
    }

    pub fn opens(&self) -> Vec<String> {
        self.state().opens.clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.state().releases.clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    pub fn discoveries(&self) -> usize {
        self.state().discoveries
    }

    /// Waits until at least `count` opens have been requested.
    pub async fn wait_opened(&self, count: usize) {
        self.wait_until(|s| s.opens.len() >= count).await;
    }

    /// Waits until at least `count` releases have happened.
    pub async fn wait_released(&self, count: usize) {
        self.wait_until(|s| s.releases.len() >= count).await;
    }

    async fn wait_until(&self, done: impl Fn(&SimState) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            if done(&self.state()) {
                return;
            }
            notified.await;
        }
    }
}

fn key(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

impl Transport for SimulatedTransport {
    fn open(&self, address: &str) -> TransportFuture<'_, mpsc::Receiver<TransportSignal>> {
        let address = key(address);
        Box::pin(async move {
            let result = {
                let mut state = self.state();
                state.opens.push(address.clone());
                match state.open_error.take() {
                    Some(e) => Err(e),
                    None => {
                        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
                        if state.auto_link_up {
                            let _ = tx.try_send(TransportSignal::LinkUp);
                        }
                        state.links.insert(address, tx);
                        Ok(rx)
                    }
                }
            };
            self.inner.changed.notify_waiters();
            result
        })
    }

    fn discover(&self, _address: &str) -> TransportFuture<'_, ServiceMap> {
        Box::pin(async move {
            let pending = {
                let mut state = self.state();
                state.discoveries += 1;
                match &mut state.discovery {
                    DiscoveryMode::Immediate(result) => PendingDiscovery::Resolved(result.clone()),
                    DiscoveryMode::Held { waiter, queued } => match queued.take() {
                        Some(result) => PendingDiscovery::Resolved(result),
                        None => {
                            let (tx, rx) = oneshot::channel();
                            *waiter = Some(tx);
                            PendingDiscovery::Waiting(rx)
                        }
                    },
                }
            };
            self.inner.changed.notify_waiters();
            match pending {
                PendingDiscovery::Resolved(result) => result,
                PendingDiscovery::Waiting(rx) => rx.await.unwrap_or(Err(TransportError::LinkDown)),
            }
        })
    }

    fn write(
        &self,
        handle: &CharacteristicHandle,
        payload: &[u8],
        mode: WriteMode,
    ) -> TransportFuture<'_, ()> {
        let write = RecordedWrite {
            handle: handle.clone(),
            payload: payload.to_vec(),
            mode,
        };
        Box::pin(async move {
            let mut state = self.state();
            if let Some(e) = state.write_error.clone() {
                return Err(e);
            }
            state.writes.push(write);
            Ok(())
        })
    }

    fn release(&self, address: &str) -> TransportFuture<'_, ()> {
        let address = key(address);
        Box::pin(async move {
            {
                let mut state = self.state();
                state.links.remove(&address);
                state.releases.push(address);
            }
            self.inner.changed.notify_waiters();
            Ok(())
        })
    }
}

impl BondSource for SimulatedTransport {
    fn bonded(&self) -> TransportFuture<'_, Vec<BondedPeripheral>> {
        Box::pin(async move {
            let state = self.state();
            match &state.bonded_error {
                Some(e) => Err(e.clone()),
                None => Ok(state.bonded.clone()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_connecting_links_up_on_open() {
        let sim = SimulatedTransport::auto_connecting();
        let mut rx = sim.open("aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(rx.recv().await, Some(TransportSignal::LinkUp));
        assert_eq!(sim.opens(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);
    }

    #[tokio::test]
    async fn release_closes_the_signal_stream() {
        let sim = SimulatedTransport::new();
        let mut rx = sim.open("AA:BB:CC:DD:EE:FF").await.unwrap();
        sim.release("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert!(!sim.link_up("AA:BB:CC:DD:EE:FF"));
    }

    #[tokio::test]
    async fn queued_discovery_result_is_used() {
        let sim = SimulatedTransport::new();
        sim.hold_discovery();
        assert!(sim.finish_discovery(Ok(ServiceMap::new())));
        assert_eq!(sim.discover("x").await, Ok(ServiceMap::new()));
    }
}
