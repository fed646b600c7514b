//! Command channel: encodes logical commands and submits them to the bound
//! control characteristic.

use std::sync::Arc;

use sashlink_protocol::Command;
use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::manager::Shared;
use crate::types::WriteMode;

/// Proof that the local stack accepted a command write.
///
/// This says nothing about whether the peripheral received or executed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub command: Command,
    pub payload: [u8; 1],
}

/// Sends commands over the link manager's current session.
#[derive(Clone)]
pub struct CommandChannel {
    shared: Arc<Shared>,
}

impl CommandChannel {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Submits `command` as a no-response write.
    ///
    /// Commands sent outside `Ready` are dropped, never queued. Nothing is
    /// retried; a link lost mid-write is reported as whatever the transport
    /// returned.
    pub async fn send(&self, command: Command) -> Result<Submitted, CommandError> {
        let Some(handle) = self.shared.ready_handle() else {
            debug!(%command, state = ?self.shared.current_state(), "command dropped: link not ready");
            return Err(CommandError::NotReady);
        };

        if !self.shared.capability.is_granted("write") {
            warn!(%command, "command refused: permission not granted");
            return Err(CommandError::PermissionDenied);
        }

        let payload = command.payload();
        self.shared
            .transport
            .write(&handle, &payload, WriteMode::WithoutResponse)
            .await
            .map_err(|e| {
                warn!(%command, address = %handle.address, error = %e, "command write rejected");
                CommandError::TransportRejected(e)
            })?;

        info!(%command, address = %handle.address, "command submitted");
        Ok(Submitted { command, payload })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capability::{Capability, RevocableCapability};
    use crate::error::TransportError;
    use crate::manager::LinkManager;
    use crate::sim::SimulatedTransport;
    use crate::types::LinkState;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    async fn ready_manager(sim: &SimulatedTransport, capability: Capability) -> LinkManager {
        let mgr = LinkManager::new(Arc::new(sim.clone()), capability);
        mgr.connect(ADDR).await.unwrap();
        sim.wait_opened(1).await;
        sim.link_up(ADDR);
        let mut rx = mgr.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == LinkState::Ready))
            .await
            .expect("link never became ready")
            .unwrap();
        mgr
    }

    #[tokio::test]
    async fn not_ready_never_writes() {
        let sim = SimulatedTransport::new();
        let mgr = LinkManager::new(Arc::new(sim.clone()), Capability::always());
        let channel = mgr.command_channel();

        assert_eq!(channel.send(Command::Open).await, Err(CommandError::NotReady));

        mgr.connect(ADDR).await.unwrap();
        assert_eq!(channel.send(Command::Close).await, Err(CommandError::NotReady));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn ready_submits_single_byte_without_response() {
        let sim = SimulatedTransport::new();
        let mgr = ready_manager(&sim, Capability::always()).await;

        let submitted = mgr.send(Command::Close).await.unwrap();
        assert_eq!(submitted.payload, *b"a");

        let writes = sim.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].payload, b"a".to_vec());
        assert_eq!(writes[0].mode, WriteMode::WithoutResponse);
        assert_eq!(writes[0].handle.address, ADDR);
    }

    #[tokio::test]
    async fn revoked_permission_is_checked_at_write_time() {
        let sim = SimulatedTransport::new();
        let flag = RevocableCapability::new(true);
        let mgr = ready_manager(&sim, Capability::new(flag.clone())).await;

        flag.revoke();
        assert_eq!(mgr.send(Command::Open).await, Err(CommandError::PermissionDenied));
        assert!(sim.writes().is_empty());

        flag.grant();
        assert!(mgr.send(Command::Open).await.is_ok());
    }

    #[tokio::test]
    async fn transport_rejection_is_reported() {
        let sim = SimulatedTransport::new();
        let mgr = ready_manager(&sim, Capability::always()).await;
        let rejection = TransportError::Rejected("busy".into());
        sim.fail_writes(Some(rejection.clone()));

        assert_eq!(
            mgr.send(Command::Open).await,
            Err(CommandError::TransportRejected(rejection))
        );
        assert_eq!(mgr.current_state(), LinkState::Ready);
    }

    #[tokio::test]
    async fn channel_outliving_manager_is_not_ready() {
        let sim = SimulatedTransport::new();
        let mgr = ready_manager(&sim, Capability::always()).await;
        let channel = mgr.command_channel();
        drop(mgr);

        assert_eq!(channel.send(Command::Open).await, Err(CommandError::NotReady));
    }
}
