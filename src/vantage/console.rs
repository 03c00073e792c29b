//! High-level console driver.
//!
//! One [`Console`] owns the station parameters, the cached archive
//! interval, and the accumulator sets. Every operation acquires the port
//! for its own scope, wakes the console, runs its exchange with
//! operation-level retries, and releases the port through the guard (which
//! cancels any LOOP stream still running).
//!
//! The two streaming operations return iterator objects holding the port;
//! the consumer decides when to stop and the cancel-on-drop contract rides
//! on the guard.

use chrono::{Datelike, Local, TimeZone, Timelike, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::accum::AccumulatorSet;
use crate::config::StationConfig;
use crate::error::{WxError, WxResult};
use crate::vantage::archive::{
    self, ArchiveContext, ArchiveRecord, ARCHIVE_PAGE_LEN, ARCHIVE_RECORD_LEN, RECORDS_PER_PAGE,
};
use crate::vantage::framing;
use crate::vantage::loop_packet::{self, LoopRecord, LOOP_FRAME_LEN, LOOP_PAYLOAD_LEN};
use crate::vantage::transport::{PortGuard, PortOpener, Transport};
use crate::vantage::ACK;

/// Permitted backwards slip of archive timestamps across a DST fall-back.
const DST_DELTA: i64 = 3600;

/// Archive intervals the console accepts, in seconds.
const VALID_ARCHIVE_INTERVALS: [u32; 7] = [60, 300, 600, 900, 1800, 3600, 7200];

/// Console reception statistics from `RXCHECK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxStats {
    pub packets_received: u32,
    pub packets_missed: u32,
    pub resynchronizations: u32,
    pub max_packets_in_a_row: u32,
    pub crc_errors: u32,
}

/// Driver for a Davis VantagePro/VantagePro2 console.
pub struct Console {
    station: StationConfig,
    opener: Arc<dyn PortOpener>,
    archive_interval_secs: u32,
    accum: AccumulatorSet,
}

impl Console {
    /// Build a driver. The archive interval starts from the given value
    /// and should be refreshed from the console EEPROM at startup.
    pub fn new(station: StationConfig, opener: Arc<dyn PortOpener>, archive_interval_secs: u32) -> Self {
        Self {
            accum: AccumulatorSet::new(archive_interval_secs),
            station,
            opener,
            archive_interval_secs,
        }
    }

    pub fn archive_interval_secs(&self) -> u32 {
        self.archive_interval_secs
    }

    /// Query the console for its archive interval and adopt it.
    pub fn refresh_archive_interval(&mut self) -> WxResult<u32> {
        let interval = self.get_archive_interval()?;
        if interval != self.archive_interval_secs {
            self.archive_interval_secs = interval;
            self.accum = AccumulatorSet::new(interval);
        }
        Ok(interval)
    }

    fn wake(&self, port: &mut dyn Transport) -> WxResult<()> {
        framing::wake_console(port, self.station.max_tries, self.station.wait_before_retry)
    }

    /// Acquire the port once and run `op` against it with operation-level
    /// retries for transient faults.
    fn with_retries<T>(
        &self,
        context: &'static str,
        mut op: impl FnMut(&mut dyn Transport) -> WxResult<T>,
    ) -> WxResult<T> {
        let mut guard = PortGuard::new(self.opener.open()?);
        for attempt in 0..self.station.max_tries {
            match op(guard.port()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    debug!("Attempt {} failed while {}: {}", attempt + 1, context, e);
                }
                Err(e) => return Err(e),
            }
        }
        warn!("Max retries exceeded while {}", context);
        Err(WxError::RetriesExceeded { context })
    }

    /// Read the console clock as a host epoch.
    pub fn get_time(&self) -> WxResult<i64> {
        self.with_retries("getting console time", |port| {
            self.wake(port)?;
            framing::send_command(port, "GETTIME\n")?;
            let buf = framing::read_with_crc16(port, 8, None, "GETTIME\n", 1)?;
            let (sec, min, hour) = (buf[0] as u32, buf[1] as u32, buf[2] as u32);
            let (day, month) = (buf[3] as u32, buf[4] as u32);
            let year = buf[5] as i32 + 1900;
            chrono::NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|d| d.and_hms_opt(hour, min, sec))
                .and_then(archive::local_to_epoch)
                .ok_or_else(|| {
                    WxError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("console reported invalid time {:02x?}", &buf[..6]),
                    ))
                })
        })
    }

    /// Set the console clock, unless it is already within `max_drift`
    /// seconds of `target_ts`.
    pub fn set_time(&self, target_ts: i64, max_drift: f64) -> WxResult<()> {
        let diff = (self.get_time()? - target_ts) as f64;
        info!("Console clock error is {:.2} seconds (positive is fast)", diff);
        if diff.abs() < max_drift {
            return Ok(());
        }

        let target = match Local.timestamp_opt(target_ts, 0) {
            chrono::offset::LocalResult::Single(dt)
            | chrono::offset::LocalResult::Ambiguous(dt, _) => dt,
            chrono::offset::LocalResult::None => {
                return Err(WxError::ViolatedPrecondition(format!(
                    "target time {} is not a valid local instant",
                    target_ts
                )))
            }
        };
        // The console wants the fields in reverse order, year since 1900.
        let payload = [
            target.second() as u8,
            target.minute() as u8,
            target.hour() as u8,
            target.day() as u8,
            target.month() as u8,
            (target.year() - 1900) as u8,
        ];

        self.with_retries("setting console time", |port| {
            self.wake(port)?;
            framing::send_command(port, "SETTIME\n")?;
            framing::send_with_crc16(port, &payload, "SETTIME\n", self.station.max_tries)?;
            info!("Console clock set to {}", target);
            Ok(())
        })
    }

    /// Read the archive interval from EEPROM address 0x2D, in seconds.
    pub fn get_archive_interval(&self) -> WxResult<u32> {
        self.with_retries("getting archive interval", |port| {
            self.wake(port)?;
            framing::send_command(port, "EEBRD 2D 01\n")?;
            let buf = framing::read_with_crc16(port, 3, None, "EEBRD 2D 01\n", 1)?;
            Ok(buf[0] as u32 * 60)
        })
    }

    /// Set the archive interval. Only the console's own menu of intervals
    /// is accepted; anything else fails before the port is touched.
    ///
    /// Changing the interval invalidates the console's archive memory, so
    /// callers normally follow up with [`Console::clear_log`].
    pub fn set_archive_interval(&mut self, interval_secs: u32) -> WxResult<()> {
        if !VALID_ARCHIVE_INTERVALS.contains(&interval_secs) {
            return Err(WxError::ViolatedPrecondition(format!(
                "invalid archive interval {} seconds",
                interval_secs
            )));
        }
        let minutes = interval_secs / 60;
        let command = format!("SETPER {}\n", minutes);

        self.with_retries("setting archive interval", |port| {
            self.wake(port)?;
            // SETPER answers with an ASCII "OK", not an ACK, and takes a
            // moment to fill the buffer.
            port.write_all(command.as_bytes())?;
            thread::sleep(Duration::from_secs(1));
            let waiting = port.bytes_waiting()?;
            let buf = port.read(waiting)?;
            let reply = String::from_utf8_lossy(&buf);
            let tokens: Vec<&str> = reply.split_whitespace().collect();
            if tokens == ["OK"] {
                Ok(())
            } else {
                Err(WxError::Ack {
                    command: command.clone(),
                    got: buf.first().copied(),
                })
            }
        })?;

        self.archive_interval_secs = interval_secs;
        self.accum = AccumulatorSet::new(interval_secs);
        info!("Archive interval set to {} seconds", interval_secs);
        Ok(())
    }

    /// Clear the console's internal archive memory.
    pub fn clear_log(&self) -> WxResult<()> {
        self.with_retries("clearing archive memory", |port| {
            self.wake(port)?;
            framing::send_command(port, "CLRLOG\n")?;
            info!("Console archive memory cleared");
            Ok(())
        })
    }

    /// Read ISS reception statistics.
    pub fn rx_stats(&self) -> WxResult<RxStats> {
        self.with_retries("getting RX statistics", |port| {
            self.wake(port)?;
            // RXCHECK also answers "OK ..." instead of an ACK.
            port.write_all(b"RXCHECK\n")?;
            thread::sleep(Duration::from_millis(500));
            let waiting = port.bytes_waiting()?;
            let buf = port.read(waiting)?;
            let reply = String::from_utf8_lossy(&buf);
            let tokens: Vec<&str> = reply.split_whitespace().collect();
            if tokens.len() != 6 || tokens[0] != "OK" {
                return Err(WxError::Ack {
                    command: "RXCHECK\n".to_string(),
                    got: buf.first().copied(),
                });
            }
            let mut numbers = [0u32; 5];
            for (slot, token) in numbers.iter_mut().zip(&tokens[1..]) {
                *slot = token.parse().map_err(|_| WxError::Ack {
                    command: "RXCHECK\n".to_string(),
                    got: buf.first().copied(),
                })?;
            }
            Ok(RxStats {
                packets_received: numbers[0],
                packets_missed: numbers[1],
                resynchronizations: numbers[2],
                max_packets_in_a_row: numbers[3],
                crc_errors: numbers[4],
            })
        })
    }

    /// Stream translated LOOP packets until the next archive record is due.
    pub fn loop_stream(&mut self) -> LoopStream<'_> {
        let interval = self.archive_interval_secs.max(1) as i64;
        let next_archive_ts =
            (Utc::now().timestamp() / interval + 1) * interval + self.station.archive_delay_secs;
        LoopStream {
            console: self,
            guard: None,
            remaining_in_batch: 0,
            next_archive_ts,
            done: false,
        }
    }

    /// Dump all archive records strictly newer than `since_ts`.
    pub fn archive_dump(&mut self, since_ts: i64) -> WxResult<ArchiveDump<'_>> {
        let guard = PortGuard::new(self.opener.open()?);
        let words = archive::epoch_to_archive_words(since_ts);
        debug!(
            "Requesting archive records since {} (date word {:#06x}, time word {:#06x})",
            since_ts, words.0, words.1
        );
        Ok(ArchiveDump {
            console: self,
            guard,
            since_words: words,
            last_good_ts: since_ts.max(0),
            attempts: 0,
            state: DumpState::NotStarted,
            queue: VecDeque::new(),
        })
    }

    fn archive_context(&self) -> ArchiveContext {
        ArchiveContext {
            interval_secs: self.archive_interval_secs,
            model_type: self.station.model_type,
            iss_id: self.station.iss_id,
            unit_system: self.station.unit_system,
        }
    }
}

/// Lazy LOOP packet stream. Ends when the next archive record comes due;
/// dropping it (or exhausting it) releases the port, which cancels the
/// console's remaining packet quota.
pub struct LoopStream<'a> {
    console: &'a mut Console,
    guard: Option<PortGuard>,
    remaining_in_batch: u32,
    next_archive_ts: i64,
    done: bool,
}

impl LoopStream<'_> {
    /// When the engine should next expect an archive record.
    pub fn next_archive_ts(&self) -> i64 {
        self.next_archive_ts
    }

    fn begin_batch(&mut self) -> WxResult<()> {
        // Any previous acquisition is released (and its LOOP cancelled)
        // before the next one opens.
        self.guard = None;
        let batch = self.console.station.loop_request_batch;
        debug!("Requesting {} LOOP packets", batch);
        let mut guard = PortGuard::new(self.console.opener.open()?);
        self.console.wake(guard.port())?;
        framing::send_command(guard.port(), &format!("LOOP {}\n", batch))?;
        self.guard = Some(guard);
        self.remaining_in_batch = batch;
        Ok(())
    }

    fn read_packet(&mut self) -> WxResult<LoopRecord> {
        let max_tries = self.console.station.max_tries;
        let unit_system = self.console.station.unit_system;
        let guard = match self.guard.as_mut() {
            Some(guard) => guard,
            None => {
                return Err(WxError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "LOOP stream has no open port",
                )))
            }
        };

        for _ in 0..max_tries {
            let buf = guard.port().read(LOOP_FRAME_LEN)?;
            if buf.len() != LOOP_FRAME_LEN {
                warn!("LOOP frame short ({} bytes), retrying", buf.len());
                continue;
            }
            if !crate::vantage::crc16::check(&buf) {
                warn!("LOOP frame CRC error, retrying");
                continue;
            }
            let raw = match loop_packet::unpack_loop_packet(&buf[..LOOP_PAYLOAD_LEN]) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("LOOP frame undecodable ({}), retrying", e);
                    continue;
                }
            };
            return loop_packet::translate_loop_packet(&raw, unit_system, Utc::now().timestamp());
        }
        Err(WxError::RetriesExceeded {
            context: "getting LOOP packets",
        })
    }
}

impl Iterator for LoopStream<'_> {
    type Item = WxResult<LoopRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        // A new archive record coming due ends the stream; releasing the
        // port wakes the console out of its remaining LOOP quota.
        if Utc::now().timestamp() >= self.next_archive_ts {
            debug!("New archive record due, cancelling LOOP stream");
            self.done = true;
            self.guard = None;
            return None;
        }

        if self.guard.is_none() || self.remaining_in_batch == 0 {
            if let Err(e) = self.begin_batch() {
                self.done = true;
                self.guard = None;
                return Some(Err(e));
            }
        }

        match self.read_packet() {
            Ok(rec) => {
                self.remaining_in_batch = self.remaining_in_batch.saturating_sub(1);
                self.console.accum.add_loop(&rec);
                Some(Ok(rec))
            }
            Err(e) => {
                self.done = true;
                self.guard = None;
                Some(Err(e))
            }
        }
    }
}

#[derive(Clone, Copy)]
enum DumpState {
    NotStarted,
    Paging { pages_left: u16, start_index: usize },
    Finished,
}

/// Lazy archive dump. A transport fault abandons the dump and retries the
/// whole exchange from the beginning, up to the configured retry budget;
/// the advancing `last_good_ts` keeps already-yielded records from
/// repeating more than the DST slack allows.
pub struct ArchiveDump<'a> {
    console: &'a mut Console,
    guard: PortGuard,
    since_words: (u16, u16),
    last_good_ts: i64,
    attempts: u32,
    state: DumpState,
    queue: VecDeque<ArchiveRecord>,
}

impl ArchiveDump<'_> {
    fn begin(&mut self) -> WxResult<DumpState> {
        let max_tries = self.console.station.max_tries;
        let port = self.guard.port();
        framing::wake_console(
            port,
            max_tries,
            self.console.station.wait_before_retry,
        )?;
        framing::send_command(port, "DMPAFT\n")?;

        let mut datestamp = [0u8; 4];
        datestamp[0..2].copy_from_slice(&self.since_words.0.to_le_bytes());
        datestamp[2..4].copy_from_slice(&self.since_words.1.to_le_bytes());
        framing::send_with_crc16(port, &datestamp, "DMPAFT\n", max_tries)?;

        let header = framing::read_with_crc16(port, 6, None, "DMPAFT\n", max_tries)?;
        let pages = u16::from_le_bytes([header[0], header[1]]);
        let start_index = u16::from_le_bytes([header[2], header[3]]) as usize;
        debug!("Retrieving {} archive page(s); starting index {}", pages, start_index);
        Ok(DumpState::Paging {
            pages_left: pages,
            start_index,
        })
    }

    /// Fetch one page and queue its live records. Returns the next state.
    fn fetch_page(&mut self, pages_left: u16, start_index: usize) -> WxResult<DumpState> {
        let max_tries = self.console.station.max_tries;
        let ctx = self.console.archive_context();
        let page = framing::read_with_crc16(
            self.guard.port(),
            ARCHIVE_PAGE_LEN,
            Some(&[ACK]),
            "DMPAFT page",
            max_tries,
        )?;

        for index in start_index..RECORDS_PER_PAGE {
            let offset = 1 + ARCHIVE_RECORD_LEN * index;
            let slot = &page[offset..offset + ARCHIVE_RECORD_LEN];
            // A never-written slot means the console was recently
            // initialized; the dump is over.
            if archive::is_unused_slot(slot) {
                return Ok(DumpState::Finished);
            }
            let raw = archive::unpack_archive_packet(slot)?;
            let mut record = archive::translate_archive_packet(&raw, &ctx)?;

            // Declining timestamps mark the wrap-around point, except for
            // the bounded slip a DST fall-back causes.
            let ts = match record.date_time {
                Some(ts) if ts + DST_DELTA > self.last_good_ts => ts,
                _ => return Ok(DumpState::Finished),
            };
            self.console.accum.merge_into(&mut record);
            self.last_good_ts = ts;
            self.queue.push_back(record);
        }

        Ok(DumpState::Paging {
            pages_left: pages_left - 1,
            start_index: 0,
        })
    }

    /// Handle a fault: transient errors restart the dump from scratch
    /// until the retry budget is spent, anything else surfaces as-is.
    fn fault(&mut self, error: WxError) -> Option<WxError> {
        if !error.is_transient() {
            return Some(error);
        }
        self.attempts += 1;
        if self.attempts >= self.console.station.max_tries {
            warn!("Max retries exceeded while dumping archive memory");
            return Some(WxError::RetriesExceeded {
                context: "getting archive packets",
            });
        }
        debug!("Archive dump fault ({}), restarting dump", error);
        self.queue.clear();
        self.state = DumpState::NotStarted;
        None
    }
}

impl Iterator for ArchiveDump<'_> {
    type Item = WxResult<ArchiveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.queue.pop_front() {
                return Some(Ok(record));
            }
            let step = match self.state {
                DumpState::Finished => return None,
                DumpState::NotStarted => self.begin(),
                DumpState::Paging { pages_left: 0, .. } => Ok(DumpState::Finished),
                DumpState::Paging {
                    pages_left,
                    start_index,
                } => self.fetch_page(pages_left, start_index),
            };
            match step {
                Ok(next_state) => self.state = next_state,
                Err(e) => {
                    if let Some(fatal) = self.fault(e) {
                        self.state = DumpState::Finished;
                        return Some(Err(fatal));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vantage::crc16;
    use crate::vantage::mock::MockOpener;

    fn station() -> StationConfig {
        StationConfig {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 19200,
            timeout: Duration::from_secs(5),
            wait_before_retry: Duration::from_millis(1),
            max_tries: 4,
            archive_delay_secs: 15,
            iss_id: 1,
            model_type: 2,
            unit_system: 1,
            loop_request_batch: 200,
        }
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut block = payload.to_vec();
        block.extend_from_slice(&crc16::crc16_be(payload));
        block
    }

    const WAKE: &[u8] = b"\n\r";

    #[test]
    fn test_get_time() {
        let time_block = framed(&[30, 5, 12, 15, 6, 121]); // 2021-06-15 12:05:30
        let (opener, _) = MockOpener::new(vec![vec![
            WAKE.to_vec(),
            vec![ACK],
            time_block,
        ]]);
        let console = Console::new(station(), opener, 300);

        let ts = console.get_time().unwrap();
        let expected = chrono::NaiveDate::from_ymd_opt(2021, 6, 15)
            .unwrap()
            .and_hms_opt(12, 5, 30)
            .unwrap();
        assert_eq!(ts, archive::local_to_epoch(expected).unwrap());
    }

    #[test]
    fn test_get_archive_interval() {
        let eeprom_block = framed(&[10]); // 10 minutes
        let (opener, _) = MockOpener::new(vec![vec![
            WAKE.to_vec(),
            vec![ACK],
            eeprom_block,
        ]]);
        let console = Console::new(station(), opener, 300);
        assert_eq!(console.get_archive_interval().unwrap(), 600);
    }

    #[test]
    fn test_set_archive_interval_reconfig() {
        let (opener, written) = MockOpener::new(vec![vec![
            WAKE.to_vec(),
            b"OK\n\r".to_vec(),
        ]]);
        let mut console = Console::new(station(), opener, 300);

        console.set_archive_interval(600).unwrap();
        assert_eq!(console.archive_interval_secs(), 600);

        let log = written.lock().unwrap();
        assert!(log.iter().any(|w| w == b"SETPER 10\n"));
    }

    #[test]
    fn test_set_archive_interval_invalid_never_touches_port() {
        let (opener, written) = MockOpener::new(vec![]);
        let mut console = Console::new(station(), opener, 300);

        let err = console.set_archive_interval(450).unwrap_err();
        assert!(matches!(err, WxError::ViolatedPrecondition(_)));
        assert_eq!(console.archive_interval_secs(), 300);
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_log() {
        let (opener, written) = MockOpener::new(vec![vec![WAKE.to_vec(), vec![ACK]]]);
        let console = Console::new(station(), opener, 300);
        console.clear_log().unwrap();
        assert!(written.lock().unwrap().iter().any(|w| w == b"CLRLOG\n"));
    }

    #[test]
    fn test_rx_stats() {
        let (opener, _) = MockOpener::new(vec![vec![
            WAKE.to_vec(),
            b"OK 21629 15 0 3204 128\n\r".to_vec(),
        ]]);
        let console = Console::new(station(), opener, 300);

        let stats = console.rx_stats().unwrap();
        assert_eq!(
            stats,
            RxStats {
                packets_received: 21629,
                packets_missed: 15,
                resynchronizations: 0,
                max_packets_in_a_row: 3204,
                crc_errors: 128,
            }
        );
    }

    #[test]
    fn test_op_retry_then_exhaustion() {
        // Console never wakes: every operation attempt fails, then the
        // op-level budget surfaces RetriesExceeded.
        let (opener, _) = MockOpener::new(vec![vec![]]);
        let mut quick = station();
        quick.max_tries = 2;
        let console = Console::new(quick, opener, 300);
        let err = console.get_time().unwrap_err();
        assert!(matches!(err, WxError::RetriesExceeded { .. }));
    }
}
