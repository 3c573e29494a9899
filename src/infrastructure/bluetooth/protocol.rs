//! Shell Racing Legends car protocol
//!
//! GATT layout and the pure payload codec. Nothing in this module performs
//! I/O.

use crate::domain::models::{
    CommandPayload, ControlState, StatusReport, TelemetryRecord, PAYLOAD_LEN,
};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::trace;

/// Vendor control service
pub const CONTROL_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";

/// Control Characteristic UUID - 8-byte drive commands, write without response
pub const CONTROL_CHAR_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

/// Status Characteristic UUID - notify only, variable length
pub const STATUS_CHAR_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";

/// Standard Battery Service (0x180F)
pub const BATTERY_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";

/// Battery Level Characteristic (0x2A19) - read + notify, 1 byte
pub const BATTERY_CHAR_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";

/// The three characteristics the client touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Control,
    Status,
    Battery,
}

impl Characteristic {
    pub fn service_uuid(self) -> &'static str {
        match self {
            Self::Control | Self::Status => CONTROL_SERVICE_UUID,
            Self::Battery => BATTERY_SERVICE_UUID,
        }
    }

    pub fn uuid(self) -> &'static str {
        match self {
            Self::Control => CONTROL_CHAR_UUID,
            Self::Status => STATUS_CHAR_UUID,
            Self::Battery => BATTERY_CHAR_UUID,
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Control => "control",
            Self::Status => "status",
            Self::Battery => "battery",
        })
    }
}

/// Build the command payload for a control state
///
/// # Payload Structure (8 bytes)
///
/// ```text
/// [0] : Mode (raw value, 1 or 2)
/// [1] : Forward  (1 when throttle > 0)
/// [2] : Reverse  (1 when throttle < 0)
/// [3] : Left     (1 when steering < 0)
/// [4] : Right    (1 when steering > 0)
/// [5] : Lights
/// [6] : Turbo
/// [7] : Donut
/// ```
pub fn encode(state: &ControlState) -> CommandPayload {
    let throttle = state.throttle.direction();
    let steering = state.steering.direction();
    [
        state.mode,
        u8::from(throttle > 0),
        u8::from(throttle < 0),
        u8::from(steering < 0),
        u8::from(steering > 0),
        u8::from(state.lights),
        u8::from(state.turbo),
        u8::from(state.donut),
    ]
}

/// Decode a notification by its length. Unknown lengths are kept as hex
/// so newer firmware never breaks the client.
pub fn decode(bytes: &[u8]) -> TelemetryRecord {
    match bytes.len() {
        1 => TelemetryRecord::Battery {
            battery_pct: bytes[0],
        },
        PAYLOAD_LEN => TelemetryRecord::Status(StatusReport {
            mode: bytes[0],
            forward: bytes[1],
            reverse: bytes[2],
            left: bytes[3],
            right: bytes[4],
            lights: bytes[5],
            turbo: bytes[6],
            donut: bytes[7],
        }),
        length => {
            trace!("Unrecognized telemetry length {}: {:02X?}", length, bytes);
            TelemetryRecord::Raw {
                length,
                raw: hex::encode(bytes),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("expected 12 hex digits, got {0}")]
    Length(usize),
    #[error("invalid hex digit in address: {0}")]
    Digit(String),
}

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BleAddress(u64);

impl BleAddress {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & 0xFFFF_FFFF_FFFF)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl FromStr for BleAddress {
    type Err = AddressParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-…` or 12 bare hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.len() != 12 {
            return Err(AddressParseError::Length(digits.len()));
        }
        let raw = u64::from_str_radix(&digits, 16)
            .map_err(|_| AddressParseError::Digit(s.to_string()))?;
        Ok(Self(raw))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}
