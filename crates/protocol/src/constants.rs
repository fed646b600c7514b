//! Protocol constants shared with the actuator firmware.

use uuid::Uuid;

/// Version of the command byte mapping. Bump when [`crate::Command`]
/// encodings change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Primary service advertised by the actuator.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_90ab_cdef_1234_567890abcdef);

/// Writable control characteristic inside [`SERVICE_UUID`].
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0xabcdef02_1234_5678_90ab_cdef12345678);

/// Wire byte for [`crate::Command::Open`].
pub const CMD_OPEN: u8 = b'b';

/// Wire byte for [`crate::Command::Close`].
pub const CMD_CLOSE: u8 = b'a';

/// Mirror keys and values.
pub mod mirror {
    /// Key holding the last commanded window position.
    pub const WINDOW_STATE_KEY: &str = "window_state";

    /// Key holding the controller's link state.
    pub const LINK_STATE_KEY: &str = "link_state";

    pub const WINDOW_OPEN: &str = "OPEN";
    pub const WINDOW_CLOSED: &str = "CLOSED";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_match_firmware_strings() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "12345678-90ab-cdef-1234-567890abcdef"
        );
        assert_eq!(
            CONTROL_CHAR_UUID.to_string(),
            "abcdef02-1234-5678-90ab-cdef12345678"
        );
    }

    #[test]
    fn command_bytes_are_distinct_ascii() {
        assert_ne!(CMD_OPEN, CMD_CLOSE);
        assert!(CMD_OPEN.is_ascii_lowercase());
        assert!(CMD_CLOSE.is_ascii_lowercase());
    }
}
