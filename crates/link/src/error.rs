//! Link, command and registry error types.

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("link is down")]
    LinkDown,

    #[error("transport rejected the request: {0}")]
    Rejected(String),
}

/// Errors from the link manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("Bluetooth connect permission not granted")]
    PermissionDenied,

    #[error("peripheral does not expose the control service/characteristic")]
    ProtocolMismatch,

    #[error("link lost")]
    LinkDown,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from [`CommandChannel::send`](crate::CommandChannel::send).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("link not ready, connect first")]
    NotReady,

    #[error("Bluetooth connect permission not granted")]
    PermissionDenied,

    #[error("write rejected: {0}")]
    TransportRejected(TransportError),
}

/// Errors from the device registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Bluetooth connect permission not granted")]
    PermissionDenied,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
