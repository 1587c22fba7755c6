//! Serial driver for the MSR145 environmental data logger.
//!
//! The logger speaks a request/response protocol over a USB serial adapter:
//! fixed 7-byte commands with a CRC-8 trailer, answered by fixed-length
//! responses that carry their own checksum. On top of that this crate walks
//! the circular recording index, pulls flash pages and decodes the packed
//! sample cells into typed, timestamped readings.
//!
//! # Timing
//!
//! Sample timestamps are in 1/512 s ticks relative to the start of their
//! recording. Add them to [`RecordingEntry::start_datetime`] for wall-clock
//! time. The device clock has no time zone.
//!
//! # Example
//! ```ignore
//! use msr145::{Msr145, SessionConfig};
//!
//! let mut logger = Msr145::open("/dev/ttyUSB0", SessionConfig::default())?;
//! for entry in logger.list_recordings(None)? {
//!     println!("{} pages from {}", entry.length, entry.start_datetime());
//! }
//! ```

mod config;
mod engine;
mod errors;
mod frame;
mod logging;
mod msr145;
mod recordings;
mod samples;
mod settings;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{BaudRate, ProtocolVariant, SessionConfig, BULK_BAUD, DEFAULT_BAUD};
pub use engine::{BaudGuard, CommandEngine};
pub use errors::*;
pub use frame::{build_frame, checksum, command, is_busy, validate_response, Command};
pub use logging::{init_logging, verbosity_level};
pub use msr145::{Msr145, TIMER_COUNT};
pub use recordings::{
    device_epoch, header_timestamp, list_recordings, read_status, span_length, RecordingEntry,
    WriteStatus, PAGE_COUNT, SENTINEL_ADDRESS,
};
pub use samples::{
    decode_cell, decode_pages, fetch_pages, read_samples, Sample, SamplePage, SampleType,
    TICKS_PER_SECOND,
};
pub use settings::{
    decode_clock, encode_clock, interval_ticks, ActiveCalibrations, ActiveMeasurements,
    AlarmLimit, CalibrationChannel, CalibrationPoints, ClockSlot, LimitMasks, LimitSettings,
    MarkerSettings, NameBlock, RecordLimit, RecordingOptions, StartCondition, StartSettings,
    TimerSettings,
};
pub use transport::{SerialTransport, Transport};
