//! Prints link state changes and mirrors them.

use sashlink_link::LinkState;
use sashlink_mirror::MirrorPublisher;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn status_line(state: LinkState) -> String {
    format!("Status: {state}")
}

/// Follows `states` until the sender goes away, printing a status line and
/// mirroring the link state on every change.
pub fn spawn_status_task(
    mut states: watch::Receiver<LinkState>,
    publisher: MirrorPublisher,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let initial = *states.borrow_and_update();
        publisher.publish_link_state(initial.label());

        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("{}", status_line(state));
            publisher.publish_link_state(state.label());
        }
    })
}
