//! Wire contract for SashLink window actuators.
//!
//! Holds the GATT identifiers the firmware exposes, the single-byte command
//! encoding, and the keys/values published to the state mirror.

pub mod command;
pub mod constants;

pub use command::{Command, ParseCommandError};
pub use constants::{CONTROL_CHAR_UUID, PROTOCOL_VERSION, SERVICE_UUID};
