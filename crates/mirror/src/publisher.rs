//! Fire-and-forget publishing of controller state.

use std::sync::Arc;

use sashlink_protocol::Command;
use sashlink_protocol::constants::mirror::{LINK_STATE_KEY, WINDOW_STATE_KEY};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::StateMirror;

/// Publishes window and link state to a [`StateMirror`] on background
/// tasks, so a slow or failing mirror never delays a command.
#[derive(Clone)]
pub struct MirrorPublisher {
    mirror: Arc<dyn StateMirror>,
}

impl MirrorPublisher {
    pub fn new(mirror: Arc<dyn StateMirror>) -> Self {
        Self { mirror }
    }

    /// Records the position a submitted command asked for.
    pub fn publish_command(&self, command: Command) -> JoinHandle<()> {
        self.spawn_set(WINDOW_STATE_KEY, command.mirror_value())
    }

    /// Records the current link state label.
    pub fn publish_link_state(&self, label: &str) -> JoinHandle<()> {
        self.spawn_set(LINK_STATE_KEY, label)
    }

    fn spawn_set(&self, key: &'static str, value: &str) -> JoinHandle<()> {
        let mirror = self.mirror.clone();
        let value = value.to_string();
        tokio::spawn(async move {
            match mirror.set_value(key, &value).await {
                Ok(()) => debug!(key, value = %value, "state mirrored"),
                Err(e) => warn!(key, value = %value, error = %e, "failed to mirror state"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMirror;

    #[tokio::test]
    async fn command_sets_window_state() {
        let mirror = MemoryMirror::new();
        let publisher = MirrorPublisher::new(Arc::new(mirror.clone()));

        publisher.publish_command(Command::Open).await.unwrap();
        assert_eq!(mirror.get(WINDOW_STATE_KEY).as_deref(), Some("OPEN"));

        publisher.publish_command(Command::Close).await.unwrap();
        assert_eq!(mirror.get(WINDOW_STATE_KEY).as_deref(), Some("CLOSED"));
    }

    #[tokio::test]
    async fn link_state_uses_its_own_key() {
        let mirror = MemoryMirror::new();
        let publisher = MirrorPublisher::new(Arc::new(mirror.clone()));

        publisher.publish_link_state("ready").await.unwrap();
        assert_eq!(mirror.get(LINK_STATE_KEY).as_deref(), Some("ready"));
        assert_eq!(mirror.get(WINDOW_STATE_KEY), None);
    }

    #[tokio::test]
    async fn mirror_failure_is_swallowed() {
        let mirror = MemoryMirror::new();
        mirror.fail_with(Some("offline"));
        let publisher = MirrorPublisher::new(Arc::new(mirror.clone()));

        // The task completes normally; the failure is only logged.
        assert!(publisher.publish_command(Command::Open).await.is_ok());
        assert!(mirror.history().is_empty());
    }
}
