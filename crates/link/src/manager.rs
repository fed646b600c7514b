//! Link manager driving a single `LinkSession` against a [`Transport`].
//!
//! Every state change is funnelled through one mutex-guarded session and its
//! `apply` function. A driver task per session forwards transport signals into
//! it; inputs from a superseded session are dropped by generation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sashlink_protocol::Command;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::capability::Capability;
use crate::channel::{CommandChannel, Submitted};
use crate::error::{CommandError, LinkError};
use crate::session::{LinkSession, SessionAction, SessionInput};
use crate::transport::Transport;
use crate::types::{CharacteristicHandle, LinkState, TransportSignal};

/// State shared between the manager, its driver task and command channels.
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) capability: Capability,
    session: Mutex<LinkSession>,
    state_tx: watch::Sender<LinkState>,
    /// Cancels the driver task of the current session.
    driver: Mutex<Option<CancellationToken>>,
    /// Serialises `connect` and `close`.
    lifecycle: AsyncMutex<()>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, LinkSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn driver(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current_state(&self) -> LinkState {
        self.session().state()
    }

    /// The bound characteristic, if the session is `Ready`.
    pub(crate) fn ready_handle(&self) -> Option<CharacteristicHandle> {
        self.session().handle().cloned()
    }

    /// Applies `input` to the session if `generation` is still current.
    fn update(&self, generation: u64, input: SessionInput) -> Option<SessionAction> {
        let mut session = self.session();
        if session.generation() != generation || session.state() == LinkState::Idle {
            trace!(
                generation,
                current = session.generation(),
                ?input,
                "dropping input from superseded session"
            );
            return None;
        }
        let action = session.apply(input);
        self.publish(&session);
        action
    }

    /// Pushes the session state to subscribers. Called with the session
    /// locked so observers see transitions in order.
    fn publish(&self, session: &LinkSession) {
        let state = session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Returns true while the session `generation` can still see signals.
    fn is_live(&self, generation: u64) -> bool {
        let session = self.session();
        session.generation() == generation
            && !matches!(session.state(), LinkState::Idle | LinkState::Disconnected)
    }

    /// Returns true if a newer session targets `address`. That session owns
    /// the peripheral, so a stale opener must not release it.
    fn reopened(&self, address: &str, generation: u64) -> bool {
        let session = self.session();
        session.generation() != generation
            && session
                .address()
                .is_some_and(|a| a.eq_ignore_ascii_case(address))
    }

    /// Resets to `Idle` and returns the address whose transport still needs
    /// releasing, if any.
    fn detach(&self, publish: bool) -> Option<String> {
        if let Some(token) = self.driver().take() {
            token.cancel();
        }
        let mut session = self.session();
        let held = session.take_transport();
        let address = session.address().map(str::to_string);
        session.reset();
        if publish {
            self.publish(&session);
        }
        address.filter(|_| held)
    }
}

/// Owns the connection lifecycle to one peripheral at a time.
pub struct LinkManager {
    shared: Arc<Shared>,
}

impl LinkManager {
    /// Creates an idle link manager.
    pub fn new(transport: Arc<dyn Transport>, capability: Capability) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                capability,
                session: Mutex::new(LinkSession::idle()),
                state_tx,
                driver: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
            }),
        }
    }

    /// Returns the current state without blocking.
    pub fn current_state(&self) -> LinkState {
        self.shared.current_state()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state_tx.subscribe()
    }

    /// Address of the current session, if any.
    pub fn address(&self) -> Option<String> {
        self.shared.session().address().map(str::to_string)
    }

    /// Last error recorded by the current session.
    pub fn last_error(&self) -> Option<LinkError> {
        self.shared.session().last_error().cloned()
    }

    /// Returns a command channel bound to this manager's session.
    pub fn command_channel(&self) -> CommandChannel {
        CommandChannel::new(self.shared.clone())
    }

    /// Sends a command through a fresh [`CommandChannel`].
    pub async fn send(&self, command: Command) -> Result<Submitted, CommandError> {
        self.command_channel().send(command).await
    }

    /// Starts connecting to `address`.
    ///
    /// Returns once the connection has been requested; progress is observed
    /// through [`current_state`](Self::current_state) or
    /// [`subscribe`](Self::subscribe). Connecting to the address of an
    /// active session is a no-op. Any other session is torn down first.
    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        let address = address.trim();
        if !self.shared.capability.is_granted("connect") {
            warn!(address = %address, "connect refused: permission not granted");
            return Err(LinkError::PermissionDenied);
        }

        let _lifecycle = self.shared.lifecycle.lock().await;
        {
            let session = self.shared.session();
            let same_address = session
                .address()
                .is_some_and(|a| a.eq_ignore_ascii_case(address));
            if same_address && session.state().is_active() {
                debug!(address = %address, state = ?session.state(), "already connecting or connected");
                return Ok(());
            }
        }

        if let Some(stale) = self.shared.detach(false) {
            release(&*self.shared.transport, &stale).await;
        }

        let generation = {
            let mut session = self.shared.session();
            let generation = session.begin(address);
            self.shared.publish(&session);
            generation
        };

        let cancel = CancellationToken::new();
        if let Some(previous) = self.shared.driver().replace(cancel.clone()) {
            previous.cancel();
        }

        info!(address = %address, generation, "connecting");
        tokio::spawn(drive_session(
            self.shared.clone(),
            address.to_string(),
            generation,
            cancel,
        ));
        Ok(())
    }

    /// Tears down the session and returns to `Idle`.
    ///
    /// Always safe to call; the transport is released at most once per
    /// session.
    pub async fn close(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        match self.shared.detach(true) {
            Some(address) => {
                release(&*self.shared.transport, &address).await;
                info!(address = %address, "link closed");
            }
            None => debug!("close: nothing to release"),
        }
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        let Some(address) = self.shared.detach(true) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = self.shared.transport.clone();
                runtime.spawn(async move {
                    release(&*transport, &address).await;
                });
            }
            Err(_) => {
                warn!(address = %address, "link manager dropped outside a runtime, transport not released");
            }
        }
    }
}

async fn release(transport: &dyn Transport, address: &str) {
    match transport.release(address).await {
        Ok(()) => debug!(address, "transport released"),
        Err(e) => warn!(address, error = %e, "failed to release transport"),
    }
}

/// Forwards transport signals for one session until it ends or is cancelled.
async fn drive_session(
    shared: Arc<Shared>,
    address: String,
    generation: u64,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = shared.transport.open(&address) => opened,
    };
    let mut signals = match opened {
        Ok(signals) if cancel.is_cancelled() || !shared.is_live(generation) => {
            // Torn down while opening; the teardown's release came too early.
            drop(signals);
            if shared.reopened(&address, generation) {
                trace!(address = %address, generation, "late open superseded by a newer session");
            } else {
                debug!(address = %address, generation, "releasing transport opened after teardown");
                release(&*shared.transport, &address).await;
            }
            return;
        }
        Ok(signals) => signals,
        Err(e) => {
            warn!(address = %address, error = %e, "transport refused connection");
            shared.update(generation, SessionInput::OpenFailed(e));
            return;
        }
    };

    while shared.is_live(generation) {
        let signal = tokio::select! {
            _ = cancel.cancelled() => return,
            signal = signals.recv() => signal.unwrap_or(TransportSignal::LinkDown),
        };
        if signal == TransportSignal::LinkDown {
            info!(address = %address, "link down");
        }
        if let Some(SessionAction::BeginDiscovery) = shared.update(generation, signal.into()) {
            info!(address = %address, "link established");
            discover(&shared, &address, generation, &cancel, &mut signals).await;
        }
    }
    trace!(address = %address, generation, "session driver finished");
}

/// Runs service discovery. A link-down arriving first wins and abandons it.
async fn discover(
    shared: &Shared,
    address: &str,
    generation: u64,
    cancel: &CancellationToken,
    signals: &mut mpsc::Receiver<TransportSignal>,
) {
    if !shared.capability.is_granted("discover") {
        warn!(address, "permission revoked before service discovery");
        shared.update(generation, SessionInput::DiscoveryBlocked);
        return;
    }
    shared.update(generation, SessionInput::DiscoveryStarted);

    let mut discovery = shared.transport.discover(address);
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            signal = signals.recv() => match signal.unwrap_or(TransportSignal::LinkDown) {
                TransportSignal::LinkDown => {
                    info!(address, "link down during service discovery");
                    shared.update(generation, SessionInput::LinkDown);
                    return;
                }
                TransportSignal::LinkUp => trace!(address, "duplicate link-up ignored"),
            },
            result = &mut discovery => break result,
        }
    };

    match result {
        Ok(services) => {
            debug!(address, services = services.len(), "services discovered");
            shared.update(generation, SessionInput::ServicesDiscovered(services));
            if shared.current_state() == LinkState::Ready {
                info!(address, "link ready");
            }
        }
        Err(e) => {
            shared.update(generation, SessionInput::DiscoveryFailed(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sashlink_protocol::{CONTROL_CHAR_UUID, SERVICE_UUID};

    use super::*;
    use crate::capability::RevocableCapability;
    use crate::error::TransportError;
    use crate::sim::SimulatedTransport;
    use crate::types::{FailureReason, ServiceMap};

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn manager(sim: &SimulatedTransport) -> LinkManager {
        LinkManager::new(Arc::new(sim.clone()), Capability::always())
    }

    async fn wait_for(mgr: &LinkManager, want: LinkState) {
        let mut rx = mgr.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {want:?}, at {:?}", mgr.current_state()))
            .unwrap();
    }

    #[tokio::test]
    async fn new_manager_is_idle() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);
        assert_eq!(mgr.current_state(), LinkState::Idle);
        assert!(mgr.address().is_none());
        assert!(mgr.last_error().is_none());
    }

    #[tokio::test]
    async fn connect_reaches_ready() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        assert_eq!(mgr.current_state(), LinkState::Connecting);

        sim.wait_opened(1).await;
        assert!(sim.link_up(ADDR));
        wait_for(&mgr, LinkState::Ready).await;
        assert_eq!(mgr.address().as_deref(), Some(ADDR));
    }

    #[tokio::test]
    async fn connect_without_permission_changes_nothing() {
        let sim = SimulatedTransport::new();
        let flag = RevocableCapability::new(false);
        let mgr = LinkManager::new(Arc::new(sim.clone()), Capability::new(flag));

        assert_eq!(mgr.connect(ADDR).await, Err(LinkError::PermissionDenied));
        assert_eq!(mgr.current_state(), LinkState::Idle);
        assert!(sim.opens().is_empty());
    }

    #[tokio::test]
    async fn connect_same_address_is_noop() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        mgr.connect(&ADDR.to_lowercase()).await.unwrap();

        tokio::task::yield_now().await;
        assert_eq!(sim.opens().len(), 1);
        assert!(sim.releases().is_empty());
        assert_eq!(mgr.current_state(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn connect_other_address_replaces_session() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        mgr.connect("11:22:33:44:55:66").await.unwrap();
        sim.wait_opened(2).await;

        assert_eq!(sim.releases(), vec![ADDR.to_string()]);
        assert_eq!(mgr.address().as_deref(), Some("11:22:33:44:55:66"));
        // Signals for the old peripheral no longer reach the session.
        assert!(!sim.link_up(ADDR));
    }

    #[tokio::test]
    async fn open_failure_disconnects() {
        let sim = SimulatedTransport::new();
        sim.fail_next_open(TransportError::UnknownPeripheral(ADDR.into()));
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        wait_for(&mgr, LinkState::Disconnected).await;
        assert_eq!(
            mgr.last_error(),
            Some(LinkError::Transport(TransportError::UnknownPeripheral(ADDR.into())))
        );
    }

    #[tokio::test]
    async fn link_down_while_connecting() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        sim.link_down(ADDR);
        wait_for(&mgr, LinkState::Disconnected).await;
        assert_eq!(mgr.last_error(), Some(LinkError::LinkDown));
    }

    #[tokio::test]
    async fn closed_signal_stream_counts_as_link_down() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        sim.link_up(ADDR);
        wait_for(&mgr, LinkState::Ready).await;

        sim.drop_link(ADDR);
        wait_for(&mgr, LinkState::Disconnected).await;
    }

    #[tokio::test]
    async fn link_down_during_discovery_wins() {
        let sim = SimulatedTransport::new();
        sim.hold_discovery();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        sim.link_up(ADDR);
        wait_for(&mgr, LinkState::Discovering).await;

        sim.link_down(ADDR);
        wait_for(&mgr, LinkState::Disconnected).await;

        // A late discovery result is not applied.
        sim.finish_discovery(Ok(ServiceMap::new().with_service(SERVICE_UUID, [CONTROL_CHAR_UUID])));
        tokio::task::yield_now().await;
        assert_eq!(mgr.current_state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn discovery_error_fails_session() {
        let sim = SimulatedTransport::new();
        sim.set_discovery(Err(TransportError::Rejected("status 129".into())));
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        sim.link_up(ADDR);
        wait_for(&mgr, LinkState::Failed(FailureReason::DiscoveryFailed)).await;
    }

    #[tokio::test]
    async fn revoked_permission_blocks_discovery() {
        let sim = SimulatedTransport::new();
        let flag = RevocableCapability::new(true);
        let mgr = LinkManager::new(Arc::new(sim.clone()), Capability::new(flag.clone()));

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        flag.revoke();
        sim.link_up(ADDR);
        wait_for(&mgr, LinkState::LinkEstablished).await;

        tokio::task::yield_now().await;
        assert_eq!(mgr.current_state(), LinkState::LinkEstablished);
        assert_eq!(mgr.last_error(), Some(LinkError::PermissionDenied));
        assert_eq!(sim.discoveries(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.close().await;
        assert!(sim.releases().is_empty());

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        mgr.close().await;
        mgr.close().await;

        assert_eq!(mgr.current_state(), LinkState::Idle);
        assert_eq!(sim.releases(), vec![ADDR.to_string()]);
    }

    #[tokio::test]
    async fn close_mid_connection_ignores_late_signals() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        mgr.close().await;

        assert!(!sim.link_up(ADDR));
        tokio::task::yield_now().await;
        assert_eq!(mgr.current_state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn drop_releases_transport() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        drop(mgr);

        sim.wait_released(1).await;
        assert_eq!(sim.releases(), vec![ADDR.to_string()]);
    }

    #[tokio::test]
    async fn subscribers_see_each_transition() {
        let sim = SimulatedTransport::new();
        sim.hold_discovery();
        let mgr = manager(&sim);
        let mut rx = mgr.subscribe();

        mgr.connect(ADDR).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LinkState::Connecting);

        sim.wait_opened(1).await;
        sim.link_up(ADDR);
        wait_for(&mgr, LinkState::Discovering).await;

        sim.finish_discovery(Ok(ServiceMap::new().with_service(SERVICE_UUID, [CONTROL_CHAR_UUID])));
        wait_for(&mgr, LinkState::Ready).await;
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn close_right_after_connect_leaves_nothing_open() {
        for _ in 0..32 {
            let sim = SimulatedTransport::new();
            let mgr = manager(&sim);

            mgr.connect(ADDR).await.unwrap();
            mgr.close().await;
            settle().await;

            assert!(
                sim.opens().len() <= sim.releases().len(),
                "opens {:?} outlived releases {:?}",
                sim.opens(),
                sim.releases()
            );
            assert!(!sim.link_up(ADDR));
            assert_eq!(mgr.current_state(), LinkState::Idle);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_racing_open_releases_late_opens() {
        for i in 0..32 {
            let sim = SimulatedTransport::new();
            let mgr = manager(&sim);

            mgr.connect(ADDR).await.unwrap();
            if i % 2 == 0 {
                mgr.close().await;
            } else {
                mgr.connect("11:22:33:44:55:66").await.unwrap();
                mgr.close().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert!(
                sim.opens().len() <= sim.releases().len(),
                "opens {:?} outlived releases {:?}",
                sim.opens(),
                sim.releases()
            );
            assert!(!sim.link_up(ADDR));
            assert!(!sim.link_up("11:22:33:44:55:66"));
        }
    }

    #[tokio::test]
    async fn reconnect_right_after_close_reaches_ready() {
        let sim = SimulatedTransport::new();
        let mgr = manager(&sim);

        mgr.connect(ADDR).await.unwrap();
        mgr.close().await;
        mgr.connect(ADDR).await.unwrap();

        sim.wait_opened(1).await;
        assert!(sim.link_up(ADDR));
        wait_for(&mgr, LinkState::Ready).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_leave_one_session() {
        const OTHER: &str = "11:22:33:44:55:66";
        for _ in 0..32 {
            let sim = SimulatedTransport::new();
            let mgr = Arc::new(manager(&sim));

            let (a, b) = tokio::join!(
                tokio::spawn({
                    let mgr = mgr.clone();
                    async move { mgr.connect(ADDR).await }
                }),
                tokio::spawn({
                    let mgr = mgr.clone();
                    async move { mgr.connect(OTHER).await }
                }),
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            let winner = mgr.address().unwrap();
            let loser = if winner == ADDR { OTHER } else { ADDR };
            assert_eq!(mgr.current_state(), LinkState::Connecting);
            assert_eq!(sim.opens().iter().filter(|o| **o == winner).count(), 1);
            let releases = sim.releases();
            assert!(!releases.is_empty());
            assert!(releases.iter().all(|r| r == loser), "released {releases:?}");
            assert!(!sim.link_up(loser));
            assert!(sim.link_up(&winner));
            wait_for(&mgr, LinkState::Ready).await;
        }
    }
}
