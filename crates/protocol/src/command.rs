//! Logical actuator commands and their wire encoding.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{CMD_CLOSE, CMD_OPEN, mirror};

/// A logical command for the window actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Open,
    Close,
}

/// Error returned when a command name or wire byte is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCommandError {
    #[error("unknown command: {0}")]
    UnknownName(String),

    #[error("unknown command byte: 0x{0:02x}")]
    UnknownByte(u8),
}

impl Command {
    /// Returns the byte written to the control characteristic.
    pub fn wire_byte(self) -> u8 {
        match self {
            Self::Open => CMD_OPEN,
            Self::Close => CMD_CLOSE,
        }
    }

    /// Returns the complete write payload.
    pub fn payload(self) -> [u8; 1] {
        [self.wire_byte()]
    }

    /// Decodes a wire byte.
    pub fn from_wire(byte: u8) -> Result<Self, ParseCommandError> {
        match byte {
            CMD_OPEN => Ok(Self::Open),
            CMD_CLOSE => Ok(Self::Close),
            other => Err(ParseCommandError::UnknownByte(other)),
        }
    }

    /// Value published under [`mirror::WINDOW_STATE_KEY`] once this
    /// command has been submitted.
    pub fn mirror_value(self) -> &'static str {
        match self {
            Self::Open => mirror::WINDOW_OPEN,
            Self::Close => mirror::WINDOW_CLOSED,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::Close => f.write_str("Close"),
        }
    }
}

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            _ => Err(ParseCommandError::UnknownName(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_b_and_close_is_a() {
        assert_eq!(Command::Open.payload(), *b"b");
        assert_eq!(Command::Close.payload(), *b"a");
    }

    #[test]
    fn from_wire_rejects_unknown_bytes() {
        assert_eq!(Command::from_wire(b'b'), Ok(Command::Open));
        assert_eq!(Command::from_wire(b'a'), Ok(Command::Close));
        assert_eq!(
            Command::from_wire(0x00),
            Err(ParseCommandError::UnknownByte(0x00))
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("OPEN".parse::<Command>(), Ok(Command::Open));
        assert_eq!(" close ".parse::<Command>(), Ok(Command::Close));
        assert!(matches!(
            "toggle".parse::<Command>(),
            Err(ParseCommandError::UnknownName(_))
        ));
    }

    #[test]
    fn mirror_values() {
        assert_eq!(Command::Open.mirror_value(), "OPEN");
        assert_eq!(Command::Close.mirror_value(), "CLOSED");
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Command::Open).unwrap();
        assert_eq!(json, "\"open\"");
        let cmd: Command = serde_json::from_str("\"close\"").unwrap();
        assert_eq!(cmd, Command::Close);
    }
}
