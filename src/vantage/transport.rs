//! Byte transport to the console.
//!
//! The console is strictly half-duplex request/response, so all I/O here is
//! blocking; the engine runs the whole acquisition on a dedicated blocking
//! thread. [`SerialTransport`] wraps the serialport crate; [`PortOpener`]
//! abstracts acquisition so tests can inject a scripted transport.
//!
//! Every high-level operation wraps its port in a [`PortGuard`]. Dropping
//! the guard transmits the wake-up nudge that cancels any LOOP stream still
//! running on the console, then releases the port. Cancel and close are
//! deliberately separate steps: the nudge is a protocol concern, the close
//! comes with the drop of the underlying port.

use log::{debug, warn};
use serialport::ClearBuffer;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::WxResult;

/// Blocking byte I/O with a per-read overall timeout.
pub trait Transport: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> WxResult<()>;

    /// Read up to `n` bytes, blocking until `n` have arrived or the
    /// configured timeout expires. A short (possibly empty) buffer means
    /// the timeout hit; callers decide whether that is an error.
    fn read(&mut self, n: usize) -> WxResult<Vec<u8>>;

    /// Discard anything buffered on the receive side.
    fn flush_input(&mut self) -> WxResult<()>;

    /// Discard anything queued on the transmit side.
    fn flush_output(&mut self) -> WxResult<()>;

    /// Bytes currently waiting to be read.
    fn bytes_waiting(&mut self) -> WxResult<usize>;
}

/// Scoped port acquisition.
pub trait PortOpener: Send + Sync {
    fn open(&self) -> WxResult<Box<dyn Transport>>;
}

/// [`Transport`] over a real serial port.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn new(port: Box<dyn serialport::SerialPort>, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, data: &[u8]) -> WxResult<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read(&mut self, n: usize) -> WxResult<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut got = 0;
        let deadline = Instant::now() + self.timeout;
        while got < n {
            match self.port.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(k) => got += k,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        buf.truncate(got);
        Ok(buf)
    }

    fn flush_input(&mut self) -> WxResult<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn flush_output(&mut self) -> WxResult<()> {
        self.port.clear(ClearBuffer::Output)?;
        Ok(())
    }

    fn bytes_waiting(&mut self) -> WxResult<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }
}

/// Opens [`SerialTransport`]s for a configured port.
pub struct SerialOpener {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialOpener {
    pub fn new(port: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            timeout,
        }
    }
}

impl PortOpener for SerialOpener {
    fn open(&self) -> WxResult<Box<dyn Transport>> {
        let port = serialport::new(&self.port, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        debug!("Serial port '{}' opened at {} baud", self.port, self.baud_rate);
        Ok(Box::new(SerialTransport::new(port, self.timeout)))
    }
}

/// Owns an open transport for the duration of one console operation.
///
/// On drop, a single LF is written before the port goes away. If a LOOP
/// stream is still active on the console, that nudge cancels its remaining
/// packet quota; if the console is asleep it is harmless.
pub struct PortGuard {
    transport: Box<dyn Transport>,
}

impl PortGuard {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn port(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        if let Err(e) = self.transport.write_all(b"\n") {
            warn!("Failed to send cancel nudge on port release: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vantage::mock::MockPort;

    #[test]
    fn test_guard_sends_nudge_on_drop() {
        let (port, written) = MockPort::scripted(vec![]);
        {
            let mut guard = PortGuard::new(Box::new(port));
            guard.port().write_all(b"LOOP 200\n").unwrap();
        }
        let log = written.lock().unwrap();
        assert_eq!(log.last().map(Vec::as_slice), Some(&b"\n"[..]));
    }
}
