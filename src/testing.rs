//! In-memory transport and a simulated logger for unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ProtocolVariant, SessionConfig};
use crate::engine::CommandEngine;
use crate::errors::TransportError;
use crate::frame::{self, le_u16, Command, COMMAND_LEN, FRAME_LEN};
use crate::recordings::{wrap_add, wrap_sub};
use crate::transport::Transport;

pub(crate) fn test_config() -> SessionConfig {
    SessionConfig {
        read_timeout: Duration::from_millis(5),
        timeout_retries: 3,
        checksum_retries: 3,
        busy_retries: 50,
        baud_settle_delay: Duration::ZERO,
        ..SessionConfig::default()
    }
}

pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the device does in answer to one frame.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Response body, the checksum is appended.
    Body(Vec<u8>),
    /// Bytes sent exactly as given.
    Raw(Vec<u8>),
    Silence,
}

type Handler = Box<dyn FnMut(&Command) -> Reply + Send>;

struct MockState {
    baud: u32,
    rejected_baud: Option<u32>,
    frames: Vec<[u8; FRAME_LEN]>,
    partial: Vec<u8>,
    pending: VecDeque<u8>,
    script: VecDeque<Reply>,
    handler: Option<Handler>,
}

/// Transport that answers from a script or a handler closure.
///
/// Clones share state, so a test can keep one handle while the engine owns
/// another. Set-baud frames are never answered, like on the real line.
#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn with_state(script: Vec<Reply>, handler: Option<Handler>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                baud: crate::config::DEFAULT_BAUD,
                rejected_baud: None,
                frames: Vec::new(),
                partial: Vec::new(),
                pending: VecDeque::new(),
                script: script.into(),
                handler,
            })),
        }
    }

    pub(crate) fn scripted(replies: Vec<Reply>) -> Self {
        Self::with_state(replies, None)
    }

    pub(crate) fn with_handler(handler: impl FnMut(&Command) -> Reply + Send + 'static) -> Self {
        Self::with_state(Vec::new(), Some(Box::new(handler)))
    }

    /// Make the host side fail to switch to `baud`.
    pub(crate) fn reject_baud(&self, baud: u32) {
        self.state.lock().unwrap().rejected_baud = Some(baud);
    }

    pub(crate) fn frames(&self) -> Vec<[u8; FRAME_LEN]> {
        self.state.lock().unwrap().frames.clone()
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.frames()
            .iter()
            .map(|f| {
                let mut cmd = [0u8; COMMAND_LEN];
                cmd.copy_from_slice(&f[..COMMAND_LEN]);
                cmd
            })
            .collect()
    }
}

impl Transport for MockTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.partial.extend_from_slice(bytes);

        while state.partial.len() >= FRAME_LEN {
            let rest = state.partial.split_off(FRAME_LEN);
            let mut frame_bytes = [0u8; FRAME_LEN];
            frame_bytes.copy_from_slice(&state.partial);
            state.partial = rest;
            assert!(
                frame::validate_response(&frame_bytes),
                "host sent a frame with a bad checksum: {frame_bytes:02X?}"
            );
            state.frames.push(frame_bytes);

            if frame_bytes[0] == frame::OP_SET_BAUD && frame_bytes[1] == 0x01 {
                continue;
            }

            let mut command = [0u8; COMMAND_LEN];
            command.copy_from_slice(&frame_bytes[..COMMAND_LEN]);
            let reply = match state.handler.as_mut() {
                Some(handler) => handler(&command),
                None => state.script.pop_front().unwrap_or(Reply::Silence),
            };
            match reply {
                Reply::Body(body) => state.pending.extend(frame::with_checksum(body)),
                Reply::Raw(raw) => state.pending.extend(raw),
                Reply::Silence => {}
            }
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.pending.len() < buf.len() {
            let received = state.pending.len();
            state.pending.clear();
            return Err(TransportError::Timeout {
                expected: buf.len(),
                received,
            });
        }
        for slot in buf.iter_mut() {
            *slot = state.pending.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.rejected_baud == Some(baud) {
            return Err(TransportError::Io(std::io::Error::other(format!(
                "cannot switch to {baud} baud"
            ))));
        }
        state.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state.lock().unwrap().baud
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().pending.clear();
        Ok(())
    }
}

/// Sample cell with type nibble `kind`, 12-bit delta field and value.
pub(crate) fn cell(kind: u8, delta: u16, value: i16) -> [u8; 4] {
    let [lo, hi] = value.to_le_bytes();
    [
        (delta & 0xFF) as u8,
        (kind << 4) | ((delta >> 8) & 0x0F) as u8,
        lo,
        hi,
    ]
}

/// One recording in simulated flash.
#[derive(Debug, Clone)]
pub(crate) struct SimRecording {
    pub start: u16,
    /// Flushed pages.
    pub len: u16,
    /// Seconds since 2000-01-01.
    pub start_time: u32,
    /// Cells of each flushed page, missing pages read as erased.
    pub pages: Vec<Vec<[u8; 4]>>,
}

impl SimRecording {
    pub(crate) fn new(start: u16, len: u16, start_time: u32) -> Self {
        Self {
            start,
            len,
            start_time,
            pages: Vec::new(),
        }
    }

    pub(crate) fn with_pages(mut self, pages: Vec<Vec<[u8; 4]>>) -> Self {
        self.pages = pages;
        self
    }

    /// Last flushed page.
    pub(crate) fn end(&self) -> u16 {
        wrap_add(self.start, self.len.saturating_sub(1))
    }

    fn offset_of(&self, address: u16) -> u16 {
        wrap_sub(address, self.start)
    }
}

const ACK: [u8; 7] = [0x00, 0xAC, 0, 0, 0, 0, 0];
const ERASE_DONE: u8 = 0xBC;

/// Register-level model of an MSR145.
///
/// When `recording` is set the last entry of `recordings` is the active one;
/// the page after its last flushed page is the live page, whose cells sit in
/// `live_cells` until flushed.
pub(crate) struct SimulatedLogger {
    pub variant: ProtocolVariant,
    pub serial: u32,
    pub write_pointer: u16,
    pub recording: bool,
    pub recordings: Vec<SimRecording>,
    /// Forced `(status, link)` answers for index requests.
    pub index_override: HashMap<u16, (u8, u16)>,
    pub live_cells: Vec<[u8; 4]>,
    /// On the next live read, flush `live_cells` into a page first and
    /// continue with these.
    pub flush_on_live_read: Option<Vec<[u8; 4]>>,
    pub live_reads: usize,
    pub corrupt_pages: HashSet<u16>,
    /// 24 byte settings block behind `0x83/0x84 0x05`.
    pub name_block: [u8; 24],
    /// `[sec, min, hour, mday - 1, month - 1, year - 2000]` per clock.
    pub clocks: [[u8; 6]; 3],
    pub registers: HashMap<(u8, u8, u8), Command>,
    /// Per channel type: settings byte, limit 1, limit 2.
    pub limits: HashMap<u8, (u8, u16, u16)>,
    pub sensors: HashMap<u8, i16>,
    pub unlocked: bool,
    pub erased_blocks: usize,
    /// Status polls each erase stays busy for.
    pub erase_busy_polls: usize,
    erase_pending: usize,
    pub sensor_refreshes: usize,
}

impl SimulatedLogger {
    pub(crate) fn new() -> Self {
        Self {
            variant: ProtocolVariant::Current,
            serial: 0x001234,
            write_pointer: 0,
            recording: false,
            recordings: Vec::new(),
            index_override: HashMap::new(),
            live_cells: Vec::new(),
            flush_on_live_read: None,
            live_reads: 0,
            corrupt_pages: HashSet::new(),
            name_block: *b"MSR145      \x18\x00\x00\x00        ",
            clocks: [[0; 6]; 3],
            registers: HashMap::new(),
            limits: HashMap::new(),
            sensors: HashMap::new(),
            unlocked: false,
            erased_blocks: 0,
            erase_busy_polls: 2,
            erase_pending: 0,
            sensor_refreshes: 0,
        }
    }

    fn active(&self) -> Option<&SimRecording> {
        if self.recording {
            self.recordings.last()
        } else {
            None
        }
    }

    fn recording_at(&self, address: u16) -> Option<&SimRecording> {
        let active_start = self.active().map(|r| r.start);
        self.recordings.iter().rev().find(|r| {
            let span = if Some(r.start) == active_start {
                r.len + 1
            } else {
                r.len
            };
            r.offset_of(address) < span
        })
    }

    fn header(body: &mut [u8], start_time: u32) {
        let half_seconds = start_time.wrapping_mul(2);
        body[2] = (half_seconds >> 24) as u8;
        body[4] = half_seconds as u8;
        body[5] = (half_seconds >> 8) as u8;
        body[6] = (half_seconds >> 16) as u8;
    }

    fn index_reply(&self, address: u16) -> Vec<u8> {
        let mut body = vec![0u8; 9];
        let (status, link, time) = match self.index_override.get(&address) {
            Some(&(status, link)) => (status, link, 0),
            None => match self.recording_at(address) {
                Some(r) if r.start == address => (0x21, r.start, r.start_time),
                Some(r) => (0x01, r.start, r.start_time),
                None => (0xFF, 0xFFFF, 0),
            },
        };
        body[1] = status;
        Self::header(&mut body, time);
        body[7..9].copy_from_slice(&link.to_le_bytes());
        body
    }

    fn active_reply(&self) -> Vec<u8> {
        let mut body = vec![0u8; 9];
        if let Some(active) = self.active() {
            body[1] = 0x01;
            Self::header(&mut body, active.start_time);
            body[7..9].copy_from_slice(&active.start.to_le_bytes());
        } else {
            body[1] = 0xFF;
        }
        body
    }

    fn fill(&self, body: &mut [u8], start_time: u32, first_page: bool, cells: &[[u8; 4]]) {
        Self::header(body, start_time);
        let offset = if first_page {
            for (i, byte) in body[9..self.variant.first_page_offset()].iter_mut().enumerate() {
                *byte = (i / 6) as u8;
            }
            self.variant.first_page_offset()
        } else {
            self.variant.page_offset()
        };
        for (i, c) in cells.iter().enumerate() {
            let at = offset + 4 * i;
            if at + 4 <= body.len() {
                body[at..at + 4].copy_from_slice(c);
            }
        }
    }

    fn page_body(&self, address: u16, body_len: usize) -> Vec<u8> {
        let mut body = vec![0xFFu8; body_len];
        body[..9].fill(0);
        if let Some(r) = self.recording_at(address) {
            let index = r.offset_of(address) as usize;
            let cells = r.pages.get(index).cloned().unwrap_or_default();
            self.fill(&mut body, r.start_time, index == 0, &cells);
        }
        body
    }

    fn live_offset(&self) -> usize {
        match self.active() {
            Some(r) if r.len == 0 => self.variant.first_page_offset(),
            _ => self.variant.page_offset(),
        }
    }

    /// Length field of the status reply, in 16-bit words.
    fn live_words(&self) -> u16 {
        let bytes = self.live_offset() + 4 * self.live_cells.len();
        bytes.div_ceil(2) as u16
    }

    fn live_body(&mut self, body_len: usize) -> Vec<u8> {
        self.live_reads += 1;
        if let Some(next) = self.flush_on_live_read.take() {
            let flushed = std::mem::replace(&mut self.live_cells, next);
            if let Some(active) = self.recordings.last_mut() {
                active.pages.resize(active.len as usize, Vec::new());
                active.pages.push(flushed);
                active.len += 1;
            }
            self.write_pointer = wrap_add(self.write_pointer, 1);
        }
        let mut body = vec![0xFFu8; body_len];
        body[..9].fill(0);
        let start_time = self.active().map(|r| r.start_time).unwrap_or(0);
        let first = self.active().is_some_and(|r| r.len == 0);
        let cells = self.live_cells.clone();
        self.fill(&mut body, start_time, first, &cells);
        body
    }

    fn clock_index(opcode: u8, slot: u8) -> Option<usize> {
        match (opcode, slot) {
            (_, 0x00) => Some(0),
            (0x8C, 0x03) | (0x8D, 0x02) => Some(1),
            (_, 0x04) => Some(2),
            _ => None,
        }
    }

    fn register_key(cmd: &Command) -> (u8, u8, u8) {
        let family = match cmd[0] {
            0x83 | 0x84 => 0x83,
            _ => 0x88,
        };
        let key = match (family, cmd[1]) {
            (0x83, 0x02) | (0x88, 0x08) => 0,
            _ => cmd[2],
        };
        (family, cmd[1], key)
    }

    pub(crate) fn handle(&mut self, cmd: &Command) -> Reply {
        match (cmd[0], cmd[1]) {
            (0x81, 0x03) => {
                let [a, b, c, _] = self.serial.to_le_bytes();
                Reply::Body(vec![0x00, a, b, c, 0, 0, 0])
            }
            (0x82, 0x01) => {
                let status = if self.recording { 0x83 } else { 0x80 };
                let [wp_lo, wp_hi] = self.write_pointer.to_le_bytes();
                let [lw_lo, lw_hi] = self.live_words().to_le_bytes();
                Reply::Body(vec![0x00, status, 0x00, wp_lo, wp_hi, lw_lo, lw_hi])
            }
            (0x82, 0x02) => {
                let mut body = vec![0u8; 7];
                for (i, kind) in cmd[2..5].iter().enumerate() {
                    let value = self.sensors.get(kind).copied().unwrap_or(0);
                    body[1 + 2 * i..3 + 2 * i].copy_from_slice(&value.to_le_bytes());
                }
                Reply::Body(body)
            }
            (0x83, 0x05) => {
                let at = 6 * usize::from(cmd[2] & 0x03);
                let mut body = vec![0x00];
                body.extend_from_slice(&self.name_block[at..at + 6]);
                Reply::Body(body)
            }
            (0x84, 0x05) => {
                if !self.unlocked {
                    return Reply::Silence;
                }
                let at = 4 * usize::from(cmd[2]);
                if at + 4 <= self.name_block.len() {
                    self.name_block[at..at + 4].copy_from_slice(&cmd[3..7]);
                }
                Reply::Body(ACK.to_vec())
            }
            (0x85, 0x06) => {
                self.unlocked = true;
                Reply::Body(ACK.to_vec())
            }
            (0x83, _) | (0x88, 0x08) | (0x88, 0x0C) | (0x88, 0x0D) | (0x88, 0x03) | (0x88, 0x04) => {
                // unset registers echo the request so the reply is never all zero
                let stored = self
                    .registers
                    .get(&Self::register_key(cmd))
                    .copied()
                    .unwrap_or([0x00, cmd[1], cmd[2], 0, 0, 0, 0]);
                let mut body = stored.to_vec();
                body[0] = 0x00;
                Reply::Body(body)
            }
            (0x84, _) | (0x89, 0x08) | (0x89, 0x0C) | (0x89, 0x0D) | (0x89, 0x03) => {
                self.registers.insert(Self::register_key(cmd), *cmd);
                if cmd[0] == 0x84 && cmd[1] == 0x02 {
                    // start settings arm the next recording
                    self.registers.insert((0x83, 0x02, 0), *cmd);
                }
                Reply::Body(ACK.to_vec())
            }
            (0x88, 0x09) => {
                let mut record_mask = 0u16;
                let mut alarm_mask = 0u16;
                for (&kind, &(settings, _, _)) in &self.limits {
                    if settings & 0x07 != 0 {
                        record_mask |= 1 << kind;
                    }
                    if settings & 0x38 != 0 {
                        alarm_mask |= 1 << kind;
                    }
                }
                let [r_lo, r_hi] = record_mask.to_le_bytes();
                let [a_lo, a_hi] = alarm_mask.to_le_bytes();
                Reply::Body(vec![0x00, 0x09, 0x00, r_lo, r_hi, a_lo, a_hi])
            }
            (0x89, 0x09) => {
                self.limits.clear();
                Reply::Body(ACK.to_vec())
            }
            (0x88, 0x0A) => {
                let (settings, l1, l2) = self.limits.get(&cmd[2]).copied().unwrap_or_default();
                let [l1_lo, l1_hi] = l1.to_le_bytes();
                let [l2_lo, l2_hi] = l2.to_le_bytes();
                Reply::Body(vec![0x00, settings, cmd[2], l1_lo, l1_hi, l2_lo, l2_hi])
            }
            (0x89, 0x0A) => {
                let entry = self.limits.entry(cmd[2]).or_default();
                entry.0 = cmd[3];
                entry.1 = le_u16(cmd, 5);
                Reply::Body(ACK.to_vec())
            }
            (0x89, 0x0B) => {
                self.limits.entry(cmd[2]).or_default().2 = le_u16(cmd, 5);
                Reply::Body(ACK.to_vec())
            }
            (0x8C, slot) => match Self::clock_index(0x8C, slot) {
                Some(i) => {
                    let mut body = vec![0x00];
                    body.extend_from_slice(&self.clocks[i]);
                    Reply::Body(body)
                }
                None => Reply::Silence,
            },
            (0x8D, slot) => match Self::clock_index(0x8D, slot) {
                Some(i) => {
                    let sec = (cmd[3] >> 5) | ((cmd[4] >> 5) << 3);
                    self.clocks[i] = [sec, cmd[2], cmd[3] & 0x1F, cmd[4] & 0x1F, cmd[5], cmd[6]];
                    Reply::Body(ACK.to_vec())
                }
                None => Reply::Silence,
            },
            (0x86, 0x00) => {
                self.recording = true;
                Reply::Body(ACK.to_vec())
            }
            (0x86, 0x01) => {
                self.recording = false;
                Reply::Body(ACK.to_vec())
            }
            (0x86, 0x03) => {
                self.sensor_refreshes += 1;
                Reply::Body(ACK.to_vec())
            }
            (0x8A, 0x01) => Reply::Body(ACK.to_vec()),
            (0x8A, 0x06) => {
                self.erased_blocks += 1;
                self.erase_pending = self.erase_busy_polls;
                Reply::Body(ACK.to_vec())
            }
            (0x8A, 0x03) => {
                let state = if self.erase_pending == 0 {
                    ERASE_DONE
                } else {
                    self.erase_pending -= 1;
                    0x01
                };
                Reply::Body(vec![0x00, state, 0, 0, 0, 0, 0])
            }
            (0x8B, 0x00) => {
                let address = le_u16(cmd, 3);
                let read_len = usize::from(le_u16(cmd, 5));
                match (cmd[2], read_len) {
                    (0x00, 8) => Reply::Body(self.index_reply(address)),
                    (0x01, 8) => Reply::Body(self.active_reply()),
                    (0x00, _) if self.corrupt_pages.contains(&address) => {
                        let mut raw = frame::with_checksum(self.page_body(address, read_len + 1));
                        if let Some(last) = raw.last_mut() {
                            *last ^= 0x5A;
                        }
                        Reply::Raw(raw)
                    }
                    (0x00, _) => Reply::Body(self.page_body(address, read_len + 1)),
                    (_, _) => Reply::Body(self.live_body(read_len + 1)),
                }
            }
            _ => Reply::Silence,
        }
    }
}

/// Engine wired to a simulated logger through a mock transport.
pub(crate) fn engine_for(
    logger: SimulatedLogger,
) -> (CommandEngine, MockTransport, Arc<Mutex<SimulatedLogger>>) {
    let variant = logger.variant;
    engine_for_variant(logger, variant)
}

pub(crate) fn engine_for_variant(
    mut logger: SimulatedLogger,
    variant: ProtocolVariant,
) -> (CommandEngine, MockTransport, Arc<Mutex<SimulatedLogger>>) {
    init_test_logging();
    logger.variant = variant;
    let shared = Arc::new(Mutex::new(logger));
    let device = Arc::clone(&shared);
    let mock = MockTransport::with_handler(move |cmd| device.lock().unwrap().handle(cmd));
    let engine = CommandEngine::new(
        Box::new(mock.clone()),
        test_config().with_variant(variant),
    );
    (engine, mock, shared)
}
