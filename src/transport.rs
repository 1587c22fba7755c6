//! Byte transport underneath the command engine.
//!
//! The engine only needs to write bytes, read an exact number of bytes within
//! a deadline and switch the line rate, so that is all [`Transport`] offers.
//! [`SerialTransport`] implements it on top of the `serialport` crate.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::DEFAULT_BAUD;
use crate::errors::TransportError;

/// Poll interval of a single blocking read while waiting for a deadline.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Duplex byte stream to one device.
pub trait Transport: Send {
    /// Write all of `bytes` and flush.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Fill `buf` completely or fail with [`TransportError::Timeout`].
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError>;

    /// Reconfigure the host side of the line.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    fn baud_rate(&self) -> u32;

    /// Drop any bytes already received but not read.
    fn clear_input(&mut self) -> Result<(), TransportError>;
}

/// Serial line at 8N1 without flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
    baud: u32,
}

impl SerialTransport {
    /// Open `path` at the device's power-up rate.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, DEFAULT_BAUD)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
                serialport::ErrorKind::Io(ErrorKind::NotFound) => {
                    TransportError::PortNotFound(path.to_string())
                }
                _ => TransportError::Serial(e),
            })?;

        debug!("opened serial port {} at {} baud", path, DEFAULT_BAUD);
        Ok(Self {
            port,
            path: path.to_string(),
            baud: DEFAULT_BAUD,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("tx {:02X?}", bytes);
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0usize;

        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if filled < buf.len() && Instant::now() > deadline {
                return Err(TransportError::Timeout {
                    expected: buf.len(),
                    received: filled,
                });
            }
        }

        trace!("rx {} bytes", filled);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.port.set_baud_rate(baud)?;
        self.baud = baud;
        debug!("{} now at {} baud", self.path, baud);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
