//! Session configuration: link settings, retry budgets and the firmware
//! protocol variant.
//!
//! Everything here is resolved once when a session is opened and then
//! threaded through the engine, the index walker and the sample decoder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Baud rate the device powers up with and must be left at on release.
pub const DEFAULT_BAUD: u32 = 9600;

/// Rate used for bulk page transfers.
pub const BULK_BAUD: u32 = 230_400;

/// Bounded wait for a complete response before the command is resent.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The device stalls if the next command arrives right after a baud change.
const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(20);

const TIMEOUT_RETRIES: u32 = 5;
const CHECKSUM_RETRIES: u32 = 3;
const BUSY_RETRIES: u32 = 10_000;

/// Baud rates understood by the `0x85/0x01` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BaudRate {
    #[default]
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
}

impl BaudRate {
    /// Parse a numeric rate, rejecting anything the device cannot switch to.
    pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
        match value {
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            38400 => Ok(BaudRate::B38400),
            57600 => Ok(BaudRate::B57600),
            115_200 => Ok(BaudRate::B115200),
            230_400 => Ok(BaudRate::B230400),
            other => Err(ProtocolError::UnsupportedBaudRate(other)),
        }
    }

    /// Argument byte of the set-baud command.
    pub fn code(self) -> u8 {
        match self {
            BaudRate::B9600 => 0x00,
            BaudRate::B19200 => 0x01,
            BaudRate::B38400 => 0x02,
            BaudRate::B57600 => 0x03,
            BaudRate::B115200 => 0x04,
            BaudRate::B230400 => 0x05,
        }
    }

    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115_200,
            BaudRate::B230400 => 230_400,
        }
    }
}

/// Firmware protocol revision.
///
/// Observed firmware disagrees on page preamble length, on whether sample
/// time deltas are signed, on the meaning of sample type `0xA` and on how the
/// index walk ends. `Current` is the canonical variant; `Legacy` matches the
/// earliest captured traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Legacy,
    #[default]
    Current,
}

impl ProtocolVariant {
    /// Offset of the first sample cell in page 0 of a recording.
    pub fn first_page_offset(self) -> usize {
        match self {
            // 9 byte header, 6 * 15 byte counting preamble, 2 trailer bytes
            ProtocolVariant::Current => 9 + 6 * 0xF + 2,
            ProtocolVariant::Legacy => 9 + 6 * 0xF + 8,
        }
    }

    /// Offset of the first sample cell in every later page.
    pub fn page_offset(self) -> usize {
        match self {
            ProtocolVariant::Current => 17,
            ProtocolVariant::Legacy => 18,
        }
    }

    /// Whether the 11-bit time delta in a sample cell is two's complement.
    pub fn signed_deltas(self) -> bool {
        matches!(self, ProtocolVariant::Current)
    }

    /// Whether the recording-status byte of `0x82/0x01` flags an active recording.
    pub fn is_recording_flag(self, status: u8) -> bool {
        match self {
            ProtocolVariant::Current => status & 0x03 != 0,
            ProtocolVariant::Legacy => status == 0x83,
        }
    }

    /// Whether the walker understands the `0xFF` end-of-index status and
    /// stops when it comes back around to an address it already emitted.
    pub fn detects_index_end(self) -> bool {
        matches!(self, ProtocolVariant::Current)
    }

    /// Whether the currently written page can be read through the live buffer.
    pub fn supports_live_page(self) -> bool {
        matches!(self, ProtocolVariant::Current)
    }
}

impl std::str::FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(ProtocolVariant::Legacy),
            "current" => Ok(ProtocolVariant::Current),
            other => Err(format!("unknown protocol variant '{other}' (legacy, current)")),
        }
    }
}

/// Tunables of one device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Slack for a single response on top of its wire time at the current
    /// rate; past that the command is resent.
    pub read_timeout: Duration,
    /// Resends allowed after a read timeout.
    pub timeout_retries: u32,
    /// Resends allowed after a corrupt response.
    pub checksum_retries: u32,
    /// Resends allowed while the device reports busy.
    pub busy_retries: u32,
    /// Rate for page transfers, `None` keeps the default rate.
    pub bulk_baud: Option<BaudRate>,
    /// Pause after switching rates.
    pub baud_settle_delay: Duration,
    pub variant: ProtocolVariant,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            timeout_retries: TIMEOUT_RETRIES,
            checksum_retries: CHECKSUM_RETRIES,
            busy_retries: BUSY_RETRIES,
            bulk_baud: Some(BaudRate::B230400),
            baud_settle_delay: BAUD_SETTLE_DELAY,
            variant: ProtocolVariant::Current,
        }
    }
}

impl SessionConfig {
    pub fn with_variant(mut self, variant: ProtocolVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_bulk_baud(mut self, baud: Option<BaudRate>) -> Self {
        self.bulk_baud = baud;
        self
    }
}
