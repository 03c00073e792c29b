//! Framing primitives every console operation composes.
//!
//! The console sleeps aggressively and must be woken before each exchange.
//! Commands are ASCII lines answered with a single ACK byte; binary blocks
//! travel with a trailing big-endian CRC-16 and are retransmitted on
//! request with the 0x21 resend byte.

use log::debug;
use std::thread;
use std::time::Duration;

use crate::error::{WxError, WxResult};
use crate::vantage::crc16;
use crate::vantage::transport::Transport;
use crate::vantage::{ACK, RESEND};

/// Pause between the three-LF burst and the probe LF.
const WAKE_SETTLE: Duration = Duration::from_millis(500);

/// Wake the console.
///
/// Each attempt: flush both directions, send three LFs, pause, flush the
/// noise the console may have emitted, send a single probe LF, and expect
/// exactly `LF CR` back. Attempts are separated by `wait`.
pub fn wake_console(port: &mut dyn Transport, max_tries: u32, wait: Duration) -> WxResult<()> {
    for attempt in 0..max_tries {
        if attempt > 0 {
            thread::sleep(wait);
        }
        port.flush_output()?;
        port.flush_input()?;
        port.write_all(b"\n\n\n")?;
        thread::sleep(WAKE_SETTLE);
        port.flush_input()?;
        port.write_all(b"\n")?;
        let resp = port.read(2)?;
        if resp == b"\n\r" {
            return Ok(());
        }
        debug!(
            "Console did not wake on attempt {} (got {:02x?})",
            attempt + 1,
            resp
        );
    }
    Err(WxError::Wakeup { tries: max_tries })
}

/// Send an ASCII command and require the single ACK byte back.
pub fn send_command(port: &mut dyn Transport, command: &str) -> WxResult<()> {
    port.write_all(command.as_bytes())?;
    let resp = port.read(1)?;
    match resp.first() {
        Some(&byte) if byte == ACK => Ok(()),
        got => Err(WxError::Ack {
            command: command.to_string(),
            got: got.copied(),
        }),
    }
}

/// Send a binary block with its CRC appended, retransmitting the whole
/// block until the console ACKs it.
pub fn send_with_crc16(
    port: &mut dyn Transport,
    payload: &[u8],
    command: &str,
    max_tries: u32,
) -> WxResult<()> {
    let mut framed = payload.to_vec();
    framed.extend_from_slice(&crc16::crc16_be(payload));

    for attempt in 0..max_tries {
        port.write_all(&framed)?;
        let resp = port.read(1)?;
        if resp.first() == Some(&ACK) {
            return Ok(());
        }
        debug!(
            "No ACK for CRC block of {:?} on attempt {}",
            command,
            attempt + 1
        );
    }
    Err(WxError::Crc {
        command: command.to_string(),
        tries: max_tries,
    })
}

/// Read an `n`-byte CRC-framed block, requesting retransmits on short or
/// corrupt reads. The returned buffer is exactly `n` bytes and CRCs to
/// zero.
///
/// `prompt` is written once before the first read; page fetches use a
/// single ACK byte to ask the console for the next page.
pub fn read_with_crc16(
    port: &mut dyn Transport,
    n: usize,
    prompt: Option<&[u8]>,
    command: &str,
    max_tries: u32,
) -> WxResult<Vec<u8>> {
    if let Some(prompt) = prompt {
        port.write_all(prompt)?;
    }

    let mut first = true;
    for attempt in 0..max_tries {
        if !first {
            port.write_all(&[RESEND])?;
        }
        first = false;

        let buf = port.read(n)?;
        if buf.len() != n {
            debug!(
                "Short read for {:?}: {} of {} bytes on attempt {}",
                command,
                buf.len(),
                n,
                attempt + 1
            );
            continue;
        }
        if !crc16::check(&buf) {
            debug!("CRC error for {:?} on attempt {}", command, attempt + 1);
            continue;
        }
        return Ok(buf);
    }
    Err(WxError::Crc {
        command: command.to_string(),
        tries: max_tries,
    })
}
