//! Sample stream decoding.
//!
//! A recording is a run of flash pages. Each page starts with a header
//! (bytes 2, 4..6 carry the page time) and, for the first page of a
//! recording only, a counting preamble. After that come 4-byte cells:
//!
//! ```text
//!   b0        b1              b2 b3
//!   dddddddd  tttt s ddd      value (LE i16)
//!             type │ └ delta bits 10..8
//!                  └ delta unit: 0 = 1/512 s, 1 = 1 s
//! ```
//!
//! Type `0xF` cells carry a 24-bit half-second delta (`b0`, `b3`, `b2`) for
//! gaps too long for the 11-bit field. An all-`0xFF` cell is erased flash
//! and ends the stream.
//!
//! Timestamps start at 0 on the first cell of the recording and advance only
//! by the per-cell deltas. The absolute time of each page is kept in
//! [`SamplePage::page_timestamp`] but is not used to re-synchronise, so a
//! sample may drift from the page clock by a fraction of a tick.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::ProtocolVariant;
use crate::engine::CommandEngine;
use crate::errors::Result;
use crate::frame::{self, le_u16, Command, CMD_STATUS, OP_READ_MEMORY};
use crate::recordings::{header_timestamp, RecordingEntry, PAGE_COUNT};

pub const CELL_LEN: usize = 4;

/// Bytes requested per page read.
const PAGE_READ_LEN: u16 = 0x0420;

/// Ticks per second of every timestamp in this module.
pub const TICKS_PER_SECOND: u64 = 512;

const END_CELL: [u8; CELL_LEN] = [0xFF; CELL_LEN];

/// Kind of reading stored in a sample cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Pressure,
    TemperaturePressure,
    Humidity,
    TemperatureHumidity,
    Battery,
    Ext1,
    Ext2,
    Ext3,
    Ext4,
    Light,
    /// Long time delta, consumed by the decoder.
    Timestamp,
    /// Erased cell, consumed by the decoder.
    End,
    Unknown,
}

impl SampleType {
    /// Classify the high nibble of a cell's second byte.
    pub fn from_nibble(nibble: u8, variant: ProtocolVariant) -> Self {
        match nibble & 0x0F {
            0x0 => SampleType::Pressure,
            0x1 => SampleType::TemperaturePressure,
            0x5 => SampleType::Humidity,
            0x6 => SampleType::TemperatureHumidity,
            0x7 => SampleType::Ext4,
            0xA => match variant {
                ProtocolVariant::Current => SampleType::Light,
                ProtocolVariant::Legacy => SampleType::Ext1,
            },
            0xB => SampleType::Ext2,
            0xC => SampleType::Ext3,
            0xE => SampleType::Battery,
            0xF => SampleType::Timestamp,
            _ => SampleType::Unknown,
        }
    }

    /// Channel code used by the sensor, limit and calibration commands.
    pub fn code(self) -> Option<u8> {
        match self {
            SampleType::Pressure => Some(0x0),
            SampleType::TemperaturePressure => Some(0x1),
            SampleType::Humidity => Some(0x5),
            SampleType::TemperatureHumidity => Some(0x6),
            SampleType::Ext4 => Some(0x7),
            SampleType::Ext1 | SampleType::Light => Some(0xA),
            SampleType::Ext2 => Some(0xB),
            SampleType::Ext3 => Some(0xC),
            SampleType::Battery => Some(0xE),
            SampleType::Timestamp | SampleType::End | SampleType::Unknown => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, SampleType::Timestamp | SampleType::End)
    }
}

impl std::str::FromStr for SampleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pressure" | "p" => Ok(SampleType::Pressure),
            "temperature-pressure" | "tp" => Ok(SampleType::TemperaturePressure),
            "humidity" | "h" => Ok(SampleType::Humidity),
            "temperature-humidity" | "th" => Ok(SampleType::TemperatureHumidity),
            "battery" | "bat" => Ok(SampleType::Battery),
            "ext1" => Ok(SampleType::Ext1),
            "ext2" => Ok(SampleType::Ext2),
            "ext3" => Ok(SampleType::Ext3),
            "ext4" => Ok(SampleType::Ext4),
            "light" | "l1" => Ok(SampleType::Light),
            other => Err(format!("unknown sample type '{other}'")),
        }
    }
}

/// One decoded reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub sample_type: SampleType,
    /// The cell as a big-endian word.
    pub raw_value: u32,
    /// Reading in device units.
    pub value: i16,
    /// 1/512 s since the start of the recording.
    pub timestamp: u64,
}

impl Sample {
    pub fn seconds(&self) -> f64 {
        self.timestamp as f64 / TICKS_PER_SECOND as f64
    }
}

/// Cells of one flash page (or of the live buffer).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SamplePage {
    pub raw_cells: Vec<[u8; CELL_LEN]>,
    /// Absolute device time of the page, 1/512 s since 2000-01-01.
    pub page_timestamp: u64,
}

impl SamplePage {
    /// Split `response` into cells from `offset` on.
    ///
    /// The trailing checksum byte is not part of the data. Returns the page
    /// and the index of the first erased cell, if any; that cell and
    /// everything after it are not included.
    pub fn scan(response: &[u8], offset: usize) -> (Self, Option<usize>) {
        let data_end = response.len().saturating_sub(1);
        let mut raw_cells = Vec::new();
        let mut end_at = None;
        let mut at = offset;
        while at + CELL_LEN <= data_end {
            let mut cell = [0u8; CELL_LEN];
            cell.copy_from_slice(&response[at..at + CELL_LEN]);
            if cell == END_CELL {
                end_at = Some(raw_cells.len());
                break;
            }
            raw_cells.push(cell);
            at += CELL_LEN;
        }
        let page = SamplePage {
            raw_cells,
            page_timestamp: header_timestamp(response),
        };
        (page, end_at)
    }
}

/// Decode one cell, advancing `clock` by its time delta.
pub fn decode_cell(cell: [u8; CELL_LEN], clock: &mut u64, variant: ProtocolVariant) -> Sample {
    let [b0, b1, b2, b3] = cell;
    let raw_value = u32::from_be_bytes(cell);
    let value = i16::from_le_bytes([b2, b3]);

    let sample_type = if cell == END_CELL {
        SampleType::End
    } else {
        SampleType::from_nibble(b1 >> 4, variant)
    };

    match sample_type {
        SampleType::End => {}
        SampleType::Unknown => {
            warn!("unknown sample type {:#X} in cell {:02X?}", b1 >> 4, cell);
        }
        SampleType::Timestamp => {
            let half_seconds = (u64::from(b0) << 16) | (u64::from(b3) << 8) | u64::from(b2);
            *clock = clock.saturating_add(half_seconds * (TICKS_PER_SECOND / 2));
        }
        _ => {
            let bits = (u16::from(b1 & 0x0F) << 8) | u16::from(b0);
            let magnitude = bits & 0x07FF;
            let delta = if variant.signed_deltas() {
                i64::from(((magnitude << 5) as i16) >> 5)
            } else {
                i64::from(magnitude)
            };
            let delta = if bits & 0x0800 != 0 {
                delta * TICKS_PER_SECOND as i64
            } else {
                delta
            };
            *clock = clock.saturating_add_signed(delta);
        }
    }

    Sample {
        sample_type,
        raw_value,
        value,
        timestamp: *clock,
    }
}

/// Decode pages in order into the visible samples.
pub fn decode_pages(pages: &[SamplePage], variant: ProtocolVariant) -> Vec<Sample> {
    let mut clock = 0u64;
    let mut samples = Vec::new();
    for cell in pages.iter().flat_map(|p| p.raw_cells.iter()) {
        let sample = decode_cell(*cell, &mut clock, variant);
        match sample.sample_type {
            SampleType::End => break,
            SampleType::Timestamp => continue,
            _ => samples.push(sample),
        }
    }
    samples
}

fn page_command(address: u16) -> Command {
    let [lo, hi] = address.to_le_bytes();
    let [len_lo, len_hi] = PAGE_READ_LEN.to_le_bytes();
    frame::command(OP_READ_MEMORY, 0x00, [0x00, lo, hi, len_lo, len_hi])
}

fn read_page(engine: &mut CommandEngine, address: u16) -> Result<Vec<u8>> {
    trace!("reading page {:#06X}", address);
    engine.send(&page_command(address), usize::from(PAGE_READ_LEN) + 2)
}

/// Fetch the unflushed buffer of the page being written.
fn read_live_buffer(engine: &mut CommandEngine) -> Result<Vec<u8>> {
    let status = engine.send(&CMD_STATUS, 8)?;
    let length = le_u16(&status, 5).wrapping_mul(2);
    let [lo, hi] = length.to_le_bytes();
    let command = frame::command(OP_READ_MEMORY, 0x00, [0x01, 0x00, 0x00, lo, hi]);
    debug!("reading {} byte live buffer", length);
    engine.send(&command, usize::from(length) + 2)
}

/// Cells of the live page at `address`.
///
/// If the device flushed the page between the status query and the page
/// read, the flushed page is returned first, followed by the fresh live
/// buffer of the next page.
fn fetch_live(engine: &mut CommandEngine, address: u16, offset: usize) -> Result<Vec<SamplePage>> {
    let variant = engine.variant();
    let mut live = read_live_buffer(engine)?;
    let mut pages = Vec::new();
    let mut offset = offset;

    let page = read_page(engine, address)?;
    let (flushed, end_at) = SamplePage::scan(&page, offset);
    if end_at != Some(0) {
        debug!("page {:#06X} was flushed during the live read", address);
        live = read_live_buffer(engine)?;
        pages.push(flushed);
        offset = variant.page_offset();
    }

    let (live_page, _) = SamplePage::scan(&live, offset);
    pages.push(live_page);
    Ok(pages)
}

/// Read every page of `entry`, including the live buffer of an active one.
///
/// The caller decides whether the entry is still active; see
/// [`crate::Msr145::samples`].
pub fn fetch_pages(engine: &mut CommandEngine, entry: &RecordingEntry) -> Result<Vec<SamplePage>> {
    let variant = engine.variant();
    let mut pages = Vec::new();
    let mut index = 0u32;

    while index < entry.length || entry.is_active {
        if index >= u32::from(PAGE_COUNT) {
            warn!("recording at {:#06X} never ended, stopping after a full ring", entry.start_address);
            break;
        }
        let address = entry.page_address(index);
        let offset = if index == 0 {
            variant.first_page_offset()
        } else {
            variant.page_offset()
        };

        let response = read_page(engine, address)?;
        let (page, end_at) = SamplePage::scan(&response, offset);
        match end_at {
            Some(0) if entry.is_active && variant.supports_live_page() => {
                pages.extend(fetch_live(engine, address, offset)?);
                break;
            }
            Some(_) => {
                pages.push(page);
                break;
            }
            None => pages.push(page),
        }
        index += 1;
    }

    debug!(
        "read {} page(s) of recording at {:#06X}",
        pages.len(),
        entry.start_address
    );
    Ok(pages)
}

/// Fetch and decode `entry`, at the bulk rate if one is configured.
///
/// The line is back at its previous rate when this returns, also on error.
/// A failure to switch back after a successful read is returned as an error.
pub fn read_samples(engine: &mut CommandEngine, entry: &RecordingEntry) -> Result<Vec<Sample>> {
    let variant = engine.variant();
    let pages = match engine.config().bulk_baud {
        Some(baud) => {
            let mut fast = engine.raise_baud(baud)?;
            let pages = fetch_pages(&mut fast, entry)?;
            fast.finish()?;
            pages
        }
        None => fetch_pages(engine, entry)?,
    };
    Ok(decode_pages(&pages, variant))
}
