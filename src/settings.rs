//! Device settings: value types shared by the read and write paths, and the
//! write-side operations of [`Msr145`].
//!
//! Every write answers with an 8-byte acknowledgement that carries no
//! information beyond the busy bit; it is read and discarded.

use std::str::FromStr;

use bitflags::bitflags;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, ProtocolError, Result};
use crate::frame::{self, le_u16, Command};
use crate::msr145::{ascii_field, channel_code, check_timer, Msr145};
use crate::samples::{SampleType, TICKS_PER_SECOND};

// ============================================================================
// Constants
// ============================================================================

/// Bytes of the name block returned per read.
pub const NAME_BLOCK_CHUNK: usize = 6;

/// Bytes of the name block accepted per write.
const NAME_WRITE_CHUNK: usize = 4;

pub const NAME_LEN: usize = 12;
pub const CALIBRATION_NAME_LEN: usize = 8;
pub const LIGHT_UNIT_LEN: usize = 4;

/// Number of flash erase blocks.
const ERASE_BLOCKS: u16 = 0x0400;

/// Status polls allowed per erase block before giving up.
const ERASE_POLL_LIMIT: u32 = 10_000;

const ERASE_DONE: u8 = 0xBC;

const CMD_UNLOCK_NAMES: Command = [0x85, 0x06, 0, 0, 0, 0, 0];
const CMD_START: Command = [0x86, 0x00, 0, 0, 0, 0, 0];
const CMD_STOP: Command = [0x86, 0x01, 0, 0, 0, 0, 0];
const CMD_RESET_LIMITS: Command = [0x89, 0x09, 0x00, 0xFF, 0xFF, 0xFF, 0xFF];
const CMD_FORMAT_BEGIN: Command = [0x8A, 0x01, 0, 0, 0, 0, 0];
const CMD_ERASE_STATUS: Command = [0x8A, 0x03, 0, 0, 0, 0, 0];

// ============================================================================
// Names
// ============================================================================

bitflags! {
    /// Calibrations applied to the humidity/temperature sensor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ActiveCalibrations: u8 {
        const HUMIDITY = 1 << 0;
        const TEMPERATURE = 1 << 1;
        const HUMIDITY_TEMPERATURE = 1 << 2;
    }
}

/// Device name, calibration name and calibration date.
///
/// The device stores these in one block and corrupts the rest when only part
/// of it is written, so they are always written together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameBlock {
    pub name: String,
    pub calibration_name: String,
    pub calibration_date: Option<NaiveDate>,
    pub active_calibrations: ActiveCalibrations,
}

impl NameBlock {
    /// Parse the 24 bytes of the four read chunks.
    ///
    /// ```text
    ///   0..12  name      12 year-2000  13 month-1  14 day-1  15 active
    ///   16..24 calibration name
    /// ```
    pub fn from_bytes(raw: &[u8; 4 * NAME_BLOCK_CHUNK]) -> Self {
        let calibration_date = NaiveDate::from_ymd_opt(
            2000 + i32::from(raw[12]),
            u32::from(raw[13]) + 1,
            u32::from(raw[14]) + 1,
        );
        Self {
            name: ascii_field(&raw[..NAME_LEN]),
            calibration_name: ascii_field(&raw[16..16 + CALIBRATION_NAME_LEN]),
            calibration_date,
            active_calibrations: ActiveCalibrations::from_bits_retain(raw[15]),
        }
    }

    /// The six write chunks, names space padded.
    fn write_chunks(&self) -> Result<[[u8; NAME_WRITE_CHUNK]; 6]> {
        let name = padded_ascii(&self.name, NAME_LEN, "device name")?;
        let calibration = padded_ascii(&self.calibration_name, CALIBRATION_NAME_LEN, "calibration name")?;
        let (year, month, day) = match self.calibration_date {
            Some(date) => (
                device_year(date.year())?,
                date.month0() as u8,
                (date.day() - 1) as u8,
            ),
            None => (0, 0, 0),
        };

        let mut chunks = [[0u8; NAME_WRITE_CHUNK]; 6];
        for (i, chunk) in name.chunks(NAME_WRITE_CHUNK).enumerate() {
            chunks[i].copy_from_slice(chunk);
        }
        chunks[3] = [year, month, day, self.active_calibrations.bits()];
        for (i, chunk) in calibration.chunks(NAME_WRITE_CHUNK).enumerate() {
            chunks[4 + i].copy_from_slice(chunk);
        }
        Ok(chunks)
    }
}

fn padded_ascii(value: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    if !value.is_ascii() || value.len() > len {
        return Err(DriverError::InvalidArgument(format!(
            "{} must be at most {} ASCII characters, got '{}'",
            what, len, value
        )));
    }
    let mut bytes = value.as_bytes().to_vec();
    bytes.resize(len, b' ');
    Ok(bytes)
}

fn device_year(year: i32) -> Result<u8> {
    u8::try_from(year - 2000)
        .map_err(|_| DriverError::InvalidArgument(format!("year {} outside 2000..=2255", year)))
}

// ============================================================================
// Clocks
// ============================================================================

/// The three clocks of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockSlot {
    /// Real time clock.
    Device,
    /// When a time-triggered recording starts.
    RecordingStart,
    /// When a time-triggered recording stops.
    RecordingStop,
}

impl ClockSlot {
    /// Subcode of `0x8C`.
    pub fn read_code(self) -> u8 {
        match self {
            ClockSlot::Device => 0x00,
            ClockSlot::RecordingStart => 0x03,
            ClockSlot::RecordingStop => 0x04,
        }
    }

    /// Subcode of `0x8D`.
    pub fn write_code(self) -> u8 {
        match self {
            ClockSlot::Device => 0x00,
            ClockSlot::RecordingStart => 0x02,
            ClockSlot::RecordingStop => 0x04,
        }
    }
}

/// Decode `[_, sec, min, hour, mday-1, month-1, year-2000, crc]`.
pub fn decode_clock(response: &[u8]) -> Result<NaiveDateTime> {
    if response.len() < 7 {
        return Err(ProtocolError::ShortResponse {
            expected: 8,
            actual: response.len(),
        }
        .into());
    }
    let mut fields = [0u8; 6];
    fields.copy_from_slice(&response[1..7]);
    let [sec, min, hour, mday, month, year] = fields;

    NaiveDate::from_ymd_opt(
        2000 + i32::from(year),
        u32::from(month) + 1,
        u32::from(mday & 0x1F) + 1,
    )
    .and_then(|date| date.and_hms_opt(u32::from(hour & 0x1F), u32::from(min), u32::from(sec)))
    .ok_or_else(|| ProtocolError::InvalidTimestamp(fields).into())
}

/// Payload of `0x8D`: the seconds are split over the top bits of hour and day.
pub fn encode_clock(time: &NaiveDateTime) -> Result<[u8; 5]> {
    let sec = time.second() as u8;
    Ok([
        time.minute() as u8,
        time.hour() as u8 | ((sec & 0x07) << 5),
        (time.day() - 1) as u8 | ((sec >> 3) << 5),
        time.month0() as u8,
        device_year(time.year())?,
    ])
}

// ============================================================================
// Recording control
// ============================================================================

/// What starts and stops a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartCondition {
    #[default]
    Now,
    ButtonStart,
    ButtonStartStop,
    TimeStart,
    TimeStartStop,
    /// Start now, stop at the recording stop time.
    TimeStop,
}

impl StartCondition {
    /// Start and stop codes of `0x84/0x02`.
    pub fn codes(self) -> (u8, u8) {
        match self {
            StartCondition::Now => (0x01, 0x00),
            StartCondition::ButtonStart => (0x03, 0x00),
            StartCondition::ButtonStartStop => (0x03, 0x03),
            StartCondition::TimeStart => (0x02, 0x00),
            StartCondition::TimeStartStop => (0x02, 0x02),
            StartCondition::TimeStop => (0x01, 0x02),
        }
    }

    pub fn from_codes(start: u8, stop: u8) -> Self {
        match (start, stop) {
            (0x01, 0x02) => StartCondition::TimeStop,
            (0x02, 0x02) => StartCondition::TimeStartStop,
            (0x02, _) => StartCondition::TimeStart,
            (0x03, 0x03) => StartCondition::ButtonStartStop,
            (0x03, _) => StartCondition::ButtonStart,
            _ => StartCondition::Now,
        }
    }

    fn needs_start_time(self) -> bool {
        matches!(self, StartCondition::TimeStart | StartCondition::TimeStartStop)
    }

    fn needs_stop_time(self) -> bool {
        matches!(self, StartCondition::TimeStartStop | StartCondition::TimeStop)
    }
}

/// Start settings as stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSettings {
    pub condition: StartCondition,
    /// Overwrite the oldest data when memory is full.
    pub ring_buffer: bool,
}

impl StartSettings {
    pub(crate) fn from_response(response: &[u8]) -> Self {
        Self {
            condition: StartCondition::from_codes(response[2], response[3]),
            ring_buffer: response[4] & 0x01 == 0,
        }
    }
}

/// How to start the next recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingOptions {
    pub condition: StartCondition,
    pub start_time: Option<NaiveDateTime>,
    pub stop_time: Option<NaiveDateTime>,
    pub ring_buffer: bool,
}

// ============================================================================
// Timers
// ============================================================================

bitflags! {
    /// Measurements taken on each tick of a timer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ActiveMeasurements: u8 {
        const PRESSURE = 1 << 0;
        const HUMIDITY = 1 << 2;
        const TEMPERATURE = 1 << 3;
        const BATTERY = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    /// 1/512 s between measurements.
    pub interval_ticks: u32,
    pub measurements: ActiveMeasurements,
    /// Flash the LED on every measurement.
    pub blink: bool,
}

/// Convert seconds to timer ticks.
pub fn interval_ticks(seconds: f64) -> Result<u32> {
    let ticks = (seconds * TICKS_PER_SECOND as f64).round();
    if !(1.0..=f64::from(u32::MAX)).contains(&ticks) {
        return Err(DriverError::InvalidArgument(format!(
            "timer interval of {} s is out of range",
            seconds
        )));
    }
    Ok(ticks as u32)
}

// ============================================================================
// Limits, markers, calibration
// ============================================================================

/// When a channel records relative to its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordLimit {
    #[default]
    Off = 0x00,
    BelowLimit2 = 0x01,
    AboveLimit2 = 0x02,
    BetweenLimits = 0x03,
    OutsideLimits = 0x04,
    StartAboveLimit1StopBelowLimit2 = 0x05,
    StartBelowLimit1StopAboveLimit2 = 0x06,
}

/// When a channel raises an alarm relative to its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlarmLimit {
    #[default]
    Off = 0x00,
    BelowLimit1 = 0x08,
    AboveLimit1 = 0x10,
    BetweenLimits = 0x18,
    OutsideLimits = 0x20,
}

impl RecordLimit {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0x01 => RecordLimit::BelowLimit2,
            0x02 => RecordLimit::AboveLimit2,
            0x03 => RecordLimit::BetweenLimits,
            0x04 => RecordLimit::OutsideLimits,
            0x05 => RecordLimit::StartAboveLimit1StopBelowLimit2,
            0x06 => RecordLimit::StartBelowLimit1StopAboveLimit2,
            _ => RecordLimit::Off,
        }
    }
}

impl AlarmLimit {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x38 {
            0x08 => AlarmLimit::BelowLimit1,
            0x10 => AlarmLimit::AboveLimit1,
            0x18 => AlarmLimit::BetweenLimits,
            0x20 => AlarmLimit::OutsideLimits,
            _ => AlarmLimit::Off,
        }
    }
}

impl FromStr for RecordLimit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(RecordLimit::Off),
            "below2" => Ok(RecordLimit::BelowLimit2),
            "above2" => Ok(RecordLimit::AboveLimit2),
            "between" => Ok(RecordLimit::BetweenLimits),
            "outside" => Ok(RecordLimit::OutsideLimits),
            "start-above1-stop-below2" => Ok(RecordLimit::StartAboveLimit1StopBelowLimit2),
            "start-below1-stop-above2" => Ok(RecordLimit::StartBelowLimit1StopAboveLimit2),
            other => Err(format!("unknown record limit '{other}'")),
        }
    }
}

impl FromStr for AlarmLimit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(AlarmLimit::Off),
            "below1" => Ok(AlarmLimit::BelowLimit1),
            "above1" => Ok(AlarmLimit::AboveLimit1),
            "between" => Ok(AlarmLimit::BetweenLimits),
            "outside" => Ok(AlarmLimit::OutsideLimits),
            other => Err(format!("unknown alarm limit '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitSettings {
    pub record: RecordLimit,
    pub alarm: AlarmLimit,
    pub limit1: u16,
    pub limit2: u16,
}

impl LimitSettings {
    pub(crate) fn from_response(response: &[u8]) -> Self {
        Self {
            record: RecordLimit::from_bits(response[1]),
            alarm: AlarmLimit::from_bits(response[1]),
            limit1: le_u16(response, 3),
            limit2: le_u16(response, 5),
        }
    }

    fn settings_byte(&self) -> u8 {
        self.record as u8 | self.alarm as u8
    }
}

/// Channels with limits, one bit per channel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitMasks {
    pub recording: u16,
    pub alarm: u16,
}

impl LimitMasks {
    pub fn has_limit(&self, kind: SampleType) -> bool {
        kind.code()
            .is_some_and(|code| (self.recording | self.alarm) & (1 << code) != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarkerSettings {
    pub marker_on: bool,
    pub alarm_confirm_on: bool,
}

/// Channels that accept two-point calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationChannel {
    Temperature,
    Humidity,
}

impl CalibrationChannel {
    pub fn code(self) -> u8 {
        match self {
            CalibrationChannel::Temperature => 0x07,
            CalibrationChannel::Humidity => 0x05,
        }
    }
}

/// Two `(target, actual)` calibration points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationPoints {
    pub point1: (u16, u16),
    pub point2: (u16, u16),
}

fn u16_pair_payload(selector: u8, first: u16, second: u16) -> [u8; 5] {
    let [a_lo, a_hi] = first.to_le_bytes();
    let [b_lo, b_hi] = second.to_le_bytes();
    [selector, a_lo, a_hi, b_lo, b_hi]
}

// ============================================================================
// Write operations
// ============================================================================

impl Msr145 {
    /// Write name, calibration name, date and active calibrations.
    pub fn set_name_block(&mut self, block: &NameBlock) -> Result<()> {
        let chunks = block.write_chunks()?;
        self.query(CMD_UNLOCK_NAMES)?;
        for (index, chunk) in chunks.iter().enumerate() {
            let [a, b, c, d] = *chunk;
            self.query(frame::command(0x84, 0x05, [index as u8, a, b, c, d]))?;
        }
        debug!("name block written: {:?}", block);
        Ok(())
    }

    /// Rename the device, keeping the calibration fields.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let mut block = self.name_block()?;
        block.name = name.to_string();
        self.set_name_block(&block)
    }

    pub fn set_clock(&mut self, slot: ClockSlot, time: &NaiveDateTime) -> Result<()> {
        let payload = encode_clock(time)?;
        self.query(frame::command(0x8D, slot.write_code(), payload))?;
        debug!("{:?} clock set to {}", slot, time);
        Ok(())
    }

    /// Set the real time clock.
    pub fn set_time(&mut self, time: &NaiveDateTime) -> Result<()> {
        self.set_clock(ClockSlot::Device, time)
    }

    pub fn start_recording(&mut self, options: &RecordingOptions) -> Result<()> {
        let condition = options.condition;
        if condition.needs_start_time() && options.start_time.is_none() {
            return Err(DriverError::InvalidArgument(format!(
                "{:?} needs a start time",
                condition
            )));
        }
        if condition.needs_stop_time() && options.stop_time.is_none() {
            return Err(DriverError::InvalidArgument(format!(
                "{:?} needs a stop time",
                condition
            )));
        }

        if let Some(start) = &options.start_time {
            self.set_clock(ClockSlot::RecordingStart, start)?;
        }
        if let Some(stop) = &options.stop_time {
            self.set_clock(ClockSlot::RecordingStop, stop)?;
        }

        let (start_code, stop_code) = condition.codes();
        let ring_off = u8::from(!options.ring_buffer);
        self.query(frame::command(0x84, 0x02, [start_code, stop_code, ring_off, 0, 0]))?;
        self.query(CMD_START)?;
        info!("recording armed: {:?}, ring buffer {}", condition, options.ring_buffer);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        self.query(CMD_STOP)?;
        info!("recording stopped");
        Ok(())
    }

    pub fn set_timer_interval(&mut self, timer: u8, ticks: u32) -> Result<()> {
        check_timer(timer)?;
        let [a, b, c, d] = ticks.to_le_bytes();
        self.query(frame::command(0x84, 0x01, [timer, a, b, c, d]))?;
        Ok(())
    }

    /// Choose what `timer` measures. A timer with nothing to do is switched off.
    pub fn set_timer_measurements(
        &mut self,
        timer: u8,
        measurements: ActiveMeasurements,
        blink: bool,
    ) -> Result<()> {
        check_timer(timer)?;
        let enabled = u8::from(!measurements.is_empty() || blink);
        let blink_byte = u8::from(blink) << 7;
        self.query(frame::command(
            0x84,
            0x00,
            [timer, enabled, 0x00, measurements.bits(), blink_byte],
        ))?;
        Ok(())
    }

    pub fn set_timer(&mut self, timer: u8, settings: &TimerSettings) -> Result<()> {
        self.set_timer_interval(timer, settings.interval_ticks)?;
        self.set_timer_measurements(timer, settings.measurements, settings.blink)
    }

    pub fn set_limits(&mut self, kind: SampleType, limits: &LimitSettings) -> Result<()> {
        let code = channel_code(kind)?;
        let [l1_lo, l1_hi] = limits.limit1.to_le_bytes();
        let [l2_lo, l2_hi] = limits.limit2.to_le_bytes();
        self.query(frame::command(
            0x89,
            0x0A,
            [code, limits.settings_byte(), 0x00, l1_lo, l1_hi],
        ))?;
        self.query(frame::command(0x89, 0x0B, [code, 0x00, 0x00, l2_lo, l2_hi]))?;
        Ok(())
    }

    /// Disable every recording and alarm limit.
    pub fn reset_limits(&mut self) -> Result<()> {
        self.query(CMD_RESET_LIMITS)?;
        Ok(())
    }

    pub fn set_marker_settings(&mut self, settings: &MarkerSettings) -> Result<()> {
        self.query(frame::command(
            0x89,
            0x08,
            [
                u8::from(settings.marker_on),
                u8::from(settings.alarm_confirm_on),
                0,
                0,
                0,
            ],
        ))?;
        Ok(())
    }

    pub fn set_calibration(
        &mut self,
        channel: CalibrationChannel,
        points: &CalibrationPoints,
    ) -> Result<()> {
        let code = channel.code();
        let (t1, a1) = points.point1;
        let (t2, a2) = points.point2;
        self.query(frame::command(0x89, 0x0C, u16_pair_payload(code, t1, a1)))?;
        self.query(frame::command(0x89, 0x0D, u16_pair_payload(code, t2, a2)))?;
        Ok(())
    }

    /// Label shown for the light channel, up to 4 ASCII characters.
    pub fn set_light_unit(&mut self, unit: &str) -> Result<()> {
        if !unit.is_ascii() || unit.len() > LIGHT_UNIT_LEN {
            return Err(DriverError::InvalidArgument(format!(
                "light unit must be at most {} ASCII characters",
                LIGHT_UNIT_LEN
            )));
        }
        let mut bytes = [0u8; LIGHT_UNIT_LEN];
        bytes[..unit.len()].copy_from_slice(unit.as_bytes());
        let [a, b, c, d] = bytes;
        self.query(frame::command(0x89, 0x03, [0x09, a, b, c, d]))?;
        Ok(())
    }

    /// Stop any recording and erase all of flash.
    pub fn format_memory(&mut self) -> Result<()> {
        self.stop_recording()?;
        self.query(CMD_FORMAT_BEGIN)?;
        for block in 0..ERASE_BLOCKS {
            let [lo, hi] = block.to_le_bytes();
            self.query(frame::command(0x8A, 0x06, [0x00, lo, hi, 0x5A, 0xA5]))?;
            self.wait_for_erase()?;
            if block % 0x100 == 0xFF {
                debug!("erased {} of {} blocks", block + 1, ERASE_BLOCKS);
            }
        }
        info!("memory formatted");
        Ok(())
    }

    fn wait_for_erase(&mut self) -> Result<()> {
        let mut last = 0u8;
        for _ in 0..ERASE_POLL_LIMIT {
            last = self.query(CMD_ERASE_STATUS)?[1];
            if last == ERASE_DONE {
                return Ok(());
            }
        }
        Err(ProtocolError::UnexpectedStatus(last).into())
    }
}
