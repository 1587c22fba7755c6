//! Request/response exchange with the logger.
//!
//! A command is written with its checksum, then exactly `response_len` bytes
//! are read back. Three things cause a full resend of the same frame:
//!
//! - no complete reply within the read timeout (or an all-zero reply, which
//!   is what a half-woken device produces),
//! - a reply whose checksum does not match,
//! - a reply with the busy bit (0x20) set in its first byte.
//!
//! Each cause has its own retry budget from [`SessionConfig`]; running out
//! surfaces a typed error instead of spinning forever on a dead line.

use std::ops::{Deref, DerefMut};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::config::{BaudRate, ProtocolVariant, SessionConfig};
use crate::errors::{ProtocolError, Result, TransportError};
use crate::frame::{self, Command, OP_SET_BAUD};
use crate::transport::Transport;

pub struct CommandEngine {
    transport: Box<dyn Transport>,
    config: SessionConfig,
}

impl CommandEngine {
    pub fn new(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.config.variant
    }

    /// Rate the host side of the line is currently configured for.
    pub fn baud_rate(&self) -> u32 {
        self.transport.baud_rate()
    }

    /// How long a reply of `response_len` bytes may take: the configured
    /// timeout plus the time the bytes need on the wire at 10 bits each.
    pub(crate) fn reply_deadline(&self, response_len: usize) -> Duration {
        let baud = u64::from(self.baud_rate().max(1));
        let wire_micros = (response_len as u64).saturating_mul(10_000_000) / baud;
        self.config.read_timeout + Duration::from_micros(wire_micros)
    }

    /// Send `command` and return the validated `response_len`-byte reply.
    ///
    /// A zero `response_len` is a fire-and-forget command: nothing is read
    /// and an empty vector is returned.
    pub fn send(&mut self, command: &Command, response_len: usize) -> Result<Vec<u8>> {
        let frame = frame::build_frame(command);
        let mut timeouts = 0u32;
        let mut corrupt = 0u32;
        let mut busy = 0u32;

        loop {
            self.transport.write_all(&frame)?;
            if response_len == 0 {
                return Ok(Vec::new());
            }

            let mut response = vec![0u8; response_len];
            let deadline = self.reply_deadline(response_len);
            match self.transport.read_exact(&mut response, deadline) {
                Ok(()) if response.iter().all(|&b| b == 0) => {
                    // Looks like a reply but the device never answered
                    timeouts += 1;
                    if timeouts > self.config.timeout_retries {
                        return Err(TransportError::Timeout {
                            expected: response_len,
                            received: 0,
                        }
                        .into());
                    }
                    debug!("empty reply to {:02X?}, resending", command);
                    self.transport.clear_input()?;
                    continue;
                }
                Ok(()) => {}
                Err(TransportError::Timeout { expected, received }) => {
                    timeouts += 1;
                    if timeouts > self.config.timeout_retries {
                        return Err(TransportError::Timeout { expected, received }.into());
                    }
                    debug!(
                        "timeout on {:02X?} ({}/{} bytes), resend {}/{}",
                        command, received, expected, timeouts, self.config.timeout_retries
                    );
                    self.transport.clear_input()?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = frame::check_response(&response) {
                corrupt += 1;
                if corrupt > self.config.checksum_retries {
                    return Err(e.into());
                }
                warn!("{} on reply to {:02X?}, resending", e, command);
                self.transport.clear_input()?;
                continue;
            }

            if frame::is_busy(&response) {
                busy += 1;
                if busy > self.config.busy_retries {
                    return Err(ProtocolError::DeviceBusy { attempts: busy }.into());
                }
                trace!("device busy on {:02X?}, resending", command);
                continue;
            }

            trace!("reply to {:02X?}: {:02X?}", command, response);
            return Ok(response);
        }
    }

    /// Tell the device to switch rates, then follow on the host side.
    pub fn set_baud_rate(&mut self, baud: BaudRate) -> Result<()> {
        let command = frame::command(OP_SET_BAUD, 0x01, [baud.code(), 0, 0, 0, 0]);
        self.send(&command, 0)?;
        thread::sleep(self.config.baud_settle_delay);
        self.transport.set_baud_rate(baud.bits_per_second())?;
        debug!("line switched to {} baud", baud.bits_per_second());
        Ok(())
    }

    /// Switch to `baud` until the returned guard is dropped.
    ///
    /// The previous rate is restored on every exit path, including early
    /// returns with `?` while the guard is alive.
    pub fn raise_baud(&mut self, baud: BaudRate) -> Result<BaudGuard<'_>> {
        let previous = BaudRate::from_u32(self.baud_rate()).unwrap_or_default();
        if previous == baud {
            return Ok(BaudGuard {
                engine: self,
                restore: None,
            });
        }
        self.set_baud_rate(baud)?;
        Ok(BaudGuard {
            engine: self,
            restore: Some(previous),
        })
    }
}

/// Scoped line-rate change, see [`CommandEngine::raise_baud`].
///
/// Call [`BaudGuard::finish`] on the success path to see restore errors;
/// dropping the guard restores too but can only log a failure.
pub struct BaudGuard<'a> {
    engine: &'a mut CommandEngine,
    restore: Option<BaudRate>,
}

impl BaudGuard<'_> {
    /// Switch back to the previous rate now.
    pub fn finish(mut self) -> Result<()> {
        match self.restore.take() {
            Some(rate) => self.engine.set_baud_rate(rate),
            None => Ok(()),
        }
    }
}

impl Deref for BaudGuard<'_> {
    type Target = CommandEngine;

    fn deref(&self) -> &CommandEngine {
        self.engine
    }
}

impl DerefMut for BaudGuard<'_> {
    fn deref_mut(&mut self) -> &mut CommandEngine {
        self.engine
    }
}

impl Drop for BaudGuard<'_> {
    fn drop(&mut self) {
        if let Some(rate) = self.restore.take() {
            if let Err(e) = self.engine.set_baud_rate(rate) {
                warn!(
                    "failed to restore {} baud: {}",
                    rate.bits_per_second(),
                    e
                );
            }
        }
    }
}
