//! MSR145 session: the device handle and its read-side operations.
//!
//! One [`Msr145`] owns the serial line for its whole lifetime. Dropping it
//! sends the device back to 9600 baud so the next session can find it.
//! Write-side operations live in [`crate::settings`].

use std::thread;

use chrono::NaiveDateTime;
use log::{debug, info, warn};

use crate::config::{BaudRate, SessionConfig};
use crate::engine::CommandEngine;
use crate::errors::{DriverError, Result};
use crate::frame::{self, le_u16, Command};
use crate::recordings::{self, RecordingEntry, WriteStatus};
use crate::samples::{self, Sample, SampleType};
use crate::settings::{
    decode_clock, ActiveMeasurements, CalibrationChannel, CalibrationPoints, ClockSlot,
    LimitMasks, LimitSettings, MarkerSettings, NameBlock, StartSettings, TimerSettings,
    NAME_BLOCK_CHUNK,
};
use crate::transport::{SerialTransport, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Most commands answer with 7 bytes plus checksum.
pub(crate) const RESPONSE_LEN: usize = 8;

/// The sensor refresh needs this long before values can be read.
const SENSOR_SETTLE_DELAY: std::time::Duration = std::time::Duration::from_millis(20);

/// Channels answered by one `0x82/0x02` request.
const SENSORS_PER_QUERY: usize = 3;

/// Timers 0..=7 can each run their own measurement set.
pub const TIMER_COUNT: u8 = 8;

const CMD_SERIAL: Command = [0x81, 0x03, 0, 0, 0, 0, 0];
const CMD_REFRESH_SENSORS: Command = [0x86, 0x03, 0x00, 0xFF, 0, 0, 0];
const CMD_GENERAL_LIMITS: Command = [0x88, 0x09, 0, 0, 0, 0, 0];
const CMD_MARKERS: Command = [0x88, 0x08, 0, 0, 0, 0, 0];
const CMD_START_SETTINGS: Command = [0x83, 0x02, 0, 0, 0, 0, 0];
const CMD_LIGHT_UNIT: Command = [0x88, 0x03, 0x09, 0, 0, 0, 0];
const CMD_LIGHT_SCALING: Command = [0x88, 0x04, 0x09, 0, 0, 0, 0];

// ============================================================================
// Session
// ============================================================================

/// Handle to one MSR145 logger.
///
/// # Example
/// ```ignore
/// let mut logger = Msr145::open("/dev/ttyUSB0", SessionConfig::default())?;
/// println!("serial {}", logger.serial_number()?);
/// let newest = logger.recording(0)?;
/// for sample in logger.samples(&newest)? {
///     println!("{:?} {} @ {}s", sample.sample_type, sample.value, sample.seconds());
/// }
/// ```
pub struct Msr145 {
    pub(crate) engine: CommandEngine,
}

impl Msr145 {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the logger on a serial port, e.g. `/dev/ttyUSB0`.
    pub fn open(path: &str, config: SessionConfig) -> Result<Self> {
        let transport = SerialTransport::open(path)?;
        info!("connected to MSR145 on {} ({:?} protocol)", path, config.variant);
        Ok(Self::from_transport(Box::new(transport), config))
    }

    /// Wrap an already open transport.
    pub fn from_transport(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            engine: CommandEngine::new(transport, config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        self.engine.config()
    }

    /// Send an arbitrary command, for poking at undocumented opcodes.
    pub fn raw_command(&mut self, command: Command, response_len: usize) -> Result<Vec<u8>> {
        self.engine.send(&command, response_len)
    }

    pub(crate) fn query(&mut self, command: Command) -> Result<Vec<u8>> {
        self.engine.send(&command, RESPONSE_LEN)
    }

    // ------------------------------------------------------------------------
    // Identity and status
    // ------------------------------------------------------------------------

    /// Serial number as printed on the device.
    pub fn serial_number(&mut self) -> Result<String> {
        let response = self.query(CMD_SERIAL)?;
        let serial = u32::from_le_bytes([response[1], response[2], response[3], 0]);
        Ok(serial.to_string())
    }

    pub fn status(&mut self) -> Result<WriteStatus> {
        recordings::read_status(&mut self.engine)
    }

    pub fn is_recording(&mut self) -> Result<bool> {
        Ok(self.status()?.recording)
    }

    pub fn name_block(&mut self) -> Result<NameBlock> {
        let mut raw = [0u8; 4 * NAME_BLOCK_CHUNK];
        for chunk in 0..4u8 {
            let response = self.query(frame::command(0x83, 0x05, [chunk, 0, 0, 0, 0]))?;
            let at = usize::from(chunk) * NAME_BLOCK_CHUNK;
            raw[at..at + NAME_BLOCK_CHUNK].copy_from_slice(&response[1..1 + NAME_BLOCK_CHUNK]);
        }
        Ok(NameBlock::from_bytes(&raw))
    }

    pub fn name(&mut self) -> Result<String> {
        Ok(self.name_block()?.name)
    }

    pub fn calibration_name(&mut self) -> Result<String> {
        Ok(self.name_block()?.calibration_name)
    }

    /// Read one of the three device clocks.
    pub fn time(&mut self, slot: ClockSlot) -> Result<NaiveDateTime> {
        let response = self.query(frame::command(0x8C, slot.read_code(), [0; 5]))?;
        decode_clock(&response)
    }

    pub fn device_time(&mut self) -> Result<NaiveDateTime> {
        self.time(ClockSlot::Device)
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn start_settings(&mut self) -> Result<StartSettings> {
        let response = self.query(CMD_START_SETTINGS)?;
        Ok(StartSettings::from_response(&response))
    }

    pub fn timer(&mut self, timer: u8) -> Result<TimerSettings> {
        check_timer(timer)?;
        let interval = self.query(frame::command(0x83, 0x01, [timer, 0, 0, 0, 0]))?;
        let measurements = self.query(frame::command(0x83, 0x00, [timer, 0, 0, 0, 0]))?;
        Ok(TimerSettings {
            interval_ticks: u32::from_le_bytes([interval[3], interval[4], interval[5], interval[6]]),
            measurements: ActiveMeasurements::from_bits_retain(measurements[5]),
            blink: measurements[6] != 0,
        })
    }

    /// Channels that have a recording or alarm limit configured.
    pub fn limit_masks(&mut self) -> Result<LimitMasks> {
        let response = self.query(CMD_GENERAL_LIMITS)?;
        Ok(LimitMasks {
            recording: le_u16(&response, 3),
            alarm: le_u16(&response, 5),
        })
    }

    pub fn limits(&mut self, kind: SampleType) -> Result<LimitSettings> {
        let code = channel_code(kind)?;
        let response = self.query(frame::command(0x88, 0x0A, [code, 0, 0, 0, 0]))?;
        Ok(LimitSettings::from_response(&response))
    }

    pub fn marker_settings(&mut self) -> Result<MarkerSettings> {
        let response = self.query(CMD_MARKERS)?;
        Ok(MarkerSettings {
            marker_on: response[2] != 0,
            alarm_confirm_on: response[3] != 0,
        })
    }

    pub fn calibration(&mut self, channel: CalibrationChannel) -> Result<CalibrationPoints> {
        let first = self.query(frame::command(0x88, 0x0C, [channel.code(), 0, 0, 0, 0]))?;
        let second = self.query(frame::command(0x88, 0x0D, [channel.code(), 0, 0, 0, 0]))?;
        Ok(CalibrationPoints {
            point1: (le_u16(&first, 3), le_u16(&first, 5)),
            point2: (le_u16(&second, 3), le_u16(&second, 5)),
        })
    }

    /// Unit label of the light channel.
    pub fn light_unit(&mut self) -> Result<String> {
        let response = self.query(CMD_LIGHT_UNIT)?;
        Ok(ascii_field(&response[3..7]))
    }

    /// Offset and gain applied to raw light readings.
    pub fn light_scaling(&mut self) -> Result<(f32, f32)> {
        let r = self.query(CMD_LIGHT_SCALING)?;
        let offset = f32::from_le_bytes([0, r[1], r[2], r[3]]);
        let gain = f32::from_le_bytes([0, r[4], r[5], r[6]]);
        Ok((offset, gain))
    }

    /// Current readings of any number of channels.
    ///
    /// The device answers at most three channels per request, so the
    /// channels go out in groups of three, each after a sensor refresh.
    pub fn sensor_values(&mut self, kinds: &[SampleType]) -> Result<Vec<(SampleType, i16)>> {
        if kinds.is_empty() {
            return Err(DriverError::InvalidArgument(
                "at least one sensor channel is needed".to_string(),
            ));
        }
        let codes = kinds
            .iter()
            .map(|kind| channel_code(*kind))
            .collect::<Result<Vec<_>>>()?;

        let mut values = Vec::with_capacity(kinds.len());
        for (group, group_codes) in kinds
            .chunks(SENSORS_PER_QUERY)
            .zip(codes.chunks(SENSORS_PER_QUERY))
        {
            self.query(CMD_REFRESH_SENSORS)?;
            thread::sleep(SENSOR_SETTLE_DELAY);

            let mut request = [0u8; 5];
            request[..group_codes.len()].copy_from_slice(group_codes);
            let response = self.query(frame::command(0x82, 0x02, request))?;
            values.extend(group.iter().enumerate().map(|(i, kind)| {
                (*kind, i16::from_le_bytes([response[1 + 2 * i], response[2 + 2 * i]]))
            }));
        }
        debug!("sensor values: {:?}", values);
        Ok(values)
    }

    // ------------------------------------------------------------------------
    // Recordings
    // ------------------------------------------------------------------------

    /// Recordings on the device, newest first.
    pub fn list_recordings(&mut self, max_count: Option<usize>) -> Result<Vec<RecordingEntry>> {
        recordings::list_recordings(&mut self.engine, max_count)
    }

    /// The `index`-th newest recording.
    pub fn recording(&mut self, index: usize) -> Result<RecordingEntry> {
        let wanted = index
            .checked_add(1)
            .ok_or_else(|| DriverError::NotFound(format!("recording {}", index)))?;
        let entries = self.list_recordings(Some(wanted))?;
        entries.get(index).copied().ok_or_else(|| {
            DriverError::NotFound(format!(
                "recording {} (device holds {})",
                index,
                entries.len()
            ))
        })
    }

    /// Decode all samples of `entry`.
    ///
    /// An entry listed as active is re-checked first; if recording stopped in
    /// the meantime it is read like any finished one.
    pub fn samples(&mut self, entry: &RecordingEntry) -> Result<Vec<Sample>> {
        let mut entry = *entry;
        if entry.is_active && !self.is_recording()? {
            debug!("recording at {:#06X} has ended since it was listed", entry.start_address);
            entry.is_active = false;
        }
        let samples = samples::read_samples(&mut self.engine, &entry)?;
        info!(
            "read {} samples from recording at {:#06X}",
            samples.len(),
            entry.start_address
        );
        Ok(samples)
    }
}

impl Drop for Msr145 {
    fn drop(&mut self) {
        if let Err(e) = self.engine.set_baud_rate(BaudRate::default()) {
            warn!("failed to return the device to its default rate: {}", e);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn check_timer(timer: u8) -> Result<()> {
    if timer < TIMER_COUNT {
        Ok(())
    } else {
        Err(DriverError::InvalidArgument(format!(
            "timer {} out of range 0..{}",
            timer, TIMER_COUNT
        )))
    }
}

pub(crate) fn channel_code(kind: SampleType) -> Result<u8> {
    kind.code().ok_or_else(|| {
        DriverError::InvalidArgument(format!("{:?} is not a measurement channel", kind))
    })
}

/// Printable ASCII up to the first NUL, trailing padding removed.
pub(crate) fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect::<String>()
        .trim_end()
        .to_string()
}
