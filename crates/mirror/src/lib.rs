//! External mirror of the actuator's commanded state.
//!
//! The link layer never talks to the mirror; callers publish through
//! [`MirrorPublisher`] after a command has been submitted, and failures here
//! never feed back into the command path.

pub mod error;
pub mod memory;
pub mod publisher;
pub mod rest;

use std::future::Future;
use std::pin::Pin;

pub use error::MirrorError;
pub use memory::MemoryMirror;
pub use publisher::MirrorPublisher;
pub use rest::RestMirror;

/// Boxed future returned by [`StateMirror`] methods.
pub type MirrorFuture<'a> = Pin<Box<dyn Future<Output = Result<(), MirrorError>> + Send + 'a>>;

/// Key/value store the controller mirrors its state into.
pub trait StateMirror: Send + Sync {
    /// Sets `key` to `value`, replacing any previous value.
    fn set_value(&self, key: &str, value: &str) -> MirrorFuture<'_>;
}
