//! Recording index walk.
//!
//! Flash is a ring of 0x2000 pages. The device does not keep a table of
//! recordings; instead each page can be asked (`0x8B/0x00` with length 8)
//! whether it is the first page of its recording and, if not, where that first
//! page is. Starting from the write pointer the walker hops backwards one
//! recording at a time:
//!
//! ```text
//!   request boundary page ──► 0x01 "not first, first is at X" ──► request X
//!                        └──► 0x21 "this is the first page"   ──► emit, boundary = X - 1
//!                        └──► 0xFF "nothing here"             ──► done
//! ```
//!
//! Address 0x1FFF is never a valid boundary and ends the walk.

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::ProtocolVariant;
use crate::engine::CommandEngine;
use crate::errors::Result;
use crate::frame::{self, le_u16, Command, CMD_STATUS, OP_READ_MEMORY};

/// Number of pages in the circular address space.
pub const PAGE_COUNT: u16 = 0x2000;

/// Address that never holds recording data.
pub const SENTINEL_ADDRESS: u16 = 0x1FFF;

const STATUS_RESPONSE_LEN: usize = 8;
const INDEX_RESPONSE_LEN: usize = 10;

const STATUS_NOT_FIRST_PAGE: u8 = 0x01;
const STATUS_FIRST_PAGE: u8 = 0x21;
const STATUS_END_OF_INDEX: u8 = 0xFF;

/// Upper bound on index requests for one walk.
const MAX_WALK_STEPS: usize = 2 * PAGE_COUNT as usize;

/// One recording session stored on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEntry {
    /// First page, `0..0x2000`.
    pub start_address: u16,
    /// Number of pages, at least 1. Still growing while `is_active`.
    pub length: u32,
    /// Seconds since 2000-01-01 00:00:00 (device local time).
    pub start_time: u32,
    /// This is the recording the device is writing right now.
    pub is_active: bool,
}

impl RecordingEntry {
    /// Last page of the entry.
    pub fn end_address(&self) -> u16 {
        let span = self.length.saturating_sub(1) % u32::from(PAGE_COUNT);
        wrap_add(self.start_address, span as u16)
    }

    /// Address of the `index`-th page.
    pub fn page_address(&self, index: u32) -> u16 {
        wrap_add(self.start_address, (index % u32::from(PAGE_COUNT)) as u16)
    }

    pub fn start_datetime(&self) -> NaiveDateTime {
        device_epoch() + ChronoDuration::seconds(i64::from(self.start_time))
    }
}

/// Midnight, 2000-01-01: second 0 of every device timestamp.
pub fn device_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

pub(crate) fn wrap_add(address: u16, pages: u16) -> u16 {
    ((u32::from(address) + u32::from(pages)) % u32::from(PAGE_COUNT)) as u16
}

pub(crate) fn wrap_sub(address: u16, pages: u16) -> u16 {
    ((u32::from(address) + u32::from(PAGE_COUNT) - u32::from(pages % PAGE_COUNT))
        % u32::from(PAGE_COUNT)) as u16
}

/// Pages from `start` to `end` inclusive, going forward around the ring.
pub fn span_length(start: u16, end: u16) -> u32 {
    u32::from(wrap_sub(end, start)) + 1
}

/// Timestamp carried in the header of index and page responses, in 1/512 s.
///
/// The header stores a half-second counter in bytes 2, 6, 5, 4 (most to
/// least significant). Shifting the tick value right by 9 gives whole
/// seconds, which is the same number the older 23/15/7/1-bit unpacking of
/// those bytes produces.
pub fn header_timestamp(response: &[u8]) -> u64 {
    if response.len() < 7 {
        return 0;
    }
    let half_seconds = u32::from_be_bytes([response[2], response[6], response[5], response[4]]);
    u64::from(half_seconds) << 8
}

fn header_seconds(response: &[u8]) -> u32 {
    (header_timestamp(response) >> 9) as u32
}

fn read_index_command(address: u16, selector: u8) -> Command {
    let [lo, hi] = address.to_le_bytes();
    frame::command(OP_READ_MEMORY, 0x00, [selector, lo, hi, 0x08, 0x00])
}

/// Write pointer and recording flag as reported by `0x82/0x01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatus {
    /// Last flushed page.
    pub write_pointer: u16,
    pub recording: bool,
    /// Bytes waiting in the unflushed live buffer.
    pub live_len: u16,
}

pub fn read_status(engine: &mut CommandEngine) -> Result<WriteStatus> {
    let response = engine.send(&CMD_STATUS, STATUS_RESPONSE_LEN)?;
    Ok(WriteStatus {
        write_pointer: le_u16(&response, 3),
        recording: engine.variant().is_recording_flag(response[1]),
        live_len: le_u16(&response, 5).wrapping_mul(2),
    })
}

struct Walk<'a> {
    engine: &'a mut CommandEngine,
    variant: ProtocolVariant,
    entries: Vec<RecordingEntry>,
    max_count: Option<usize>,
}

impl Walk<'_> {
    fn full(&self) -> bool {
        self.max_count.is_some_and(|max| self.entries.len() >= max)
    }

    fn query(&mut self, address: u16) -> Result<Vec<u8>> {
        self.engine
            .send(&read_index_command(address, 0x00), INDEX_RESPONSE_LEN)
    }

    /// Synthesize the entry for the recording that is still being written.
    ///
    /// The write pointer is the last flushed page; the page after it is the
    /// live one, so it is counted too.
    fn active_entry(&mut self, write_pointer: u16) -> Result<RecordingEntry> {
        let mut response = self
            .engine
            .send(&read_index_command(0, 0x01), INDEX_RESPONSE_LEN)?;
        if response[1] == STATUS_NOT_FIRST_PAGE {
            let pointed = le_u16(&response, 7);
            response = self.query(pointed)?;
        }
        let start = le_u16(&response, 7) % PAGE_COUNT;
        let current = wrap_add(write_pointer, 1);
        let entry = RecordingEntry {
            start_address: start,
            length: span_length(start, current),
            start_time: header_seconds(&response),
            is_active: true,
        };
        debug!("active recording: {:?}", entry);
        Ok(entry)
    }

    fn run(mut self, status: WriteStatus) -> Result<Vec<RecordingEntry>> {
        let mut end = status.write_pointer % PAGE_COUNT;

        if status.recording {
            if self.full() {
                return Ok(self.entries);
            }
            let active = self.active_entry(status.write_pointer)?;
            end = wrap_sub(active.start_address, 1);
            self.entries.push(active);
        }

        let walk_origin = end;
        let mut start = end;
        let mut current = end;
        let mut emitted: HashSet<u16> = self.entries.iter().map(|e| e.start_address).collect();
        let mut self_link_retried = false;
        let mut steps = 0usize;

        while current != SENTINEL_ADDRESS && !self.full() {
            steps += 1;
            if steps > MAX_WALK_STEPS {
                warn!("index walk exceeded {} requests, stopping", MAX_WALK_STEPS);
                break;
            }

            let response = self.query(current)?;
            let link = le_u16(&response, 7);
            match response[1] {
                // A link back to the requested page itself shows up on entries
                // that wrap past the end of memory. Asking again settles it;
                // if the device insists, the page is the first one.
                STATUS_NOT_FIRST_PAGE if link == current && !self_link_retried => {
                    debug!("page {:#06X} links to itself, asking again", current);
                    self_link_retried = true;
                }
                STATUS_NOT_FIRST_PAGE if link != current => {
                    self_link_retried = false;
                    start = link % PAGE_COUNT;
                    current = start;
                }
                STATUS_NOT_FIRST_PAGE | STATUS_FIRST_PAGE => {
                    self_link_retried = false;
                    if self.variant.detects_index_end() && !emitted.insert(start) {
                        debug!("index wrapped back to {:#06X}, stopping", start);
                        break;
                    }
                    let entry = RecordingEntry {
                        start_address: start,
                        length: span_length(start, end),
                        start_time: header_seconds(&response),
                        is_active: false,
                    };
                    debug!("recording: {:?}", entry);
                    self.entries.push(entry);

                    end = wrap_sub(start, 1);
                    start = end;
                    current = end;
                    if self.variant.detects_index_end() && current == walk_origin {
                        break;
                    }
                }
                STATUS_END_OF_INDEX if self.variant.detects_index_end() => break,
                other => {
                    warn!(
                        "unexpected index status {:#04X} at page {:#06X}, returning {} recording(s)",
                        other,
                        current,
                        self.entries.len()
                    );
                    break;
                }
            }
        }

        Ok(self.entries)
    }
}

/// Walk the device index from newest to oldest.
///
/// `max_count` caps the number of entries returned (the active recording
/// counts). Index 0 of the result is the newest recording.
pub fn list_recordings(
    engine: &mut CommandEngine,
    max_count: Option<usize>,
) -> Result<Vec<RecordingEntry>> {
    let status = read_status(engine)?;
    debug!(
        "write pointer {:#06X}, recording: {}",
        status.write_pointer, status.recording
    );
    let walk = Walk {
        variant: engine.variant(),
        engine,
        entries: Vec::new(),
        max_count,
    };
    walk.run(status)
}
