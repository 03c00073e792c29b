//! End-to-end protocol scenarios over a scripted transport.
//!
//! Station under test: ISS id 1, model 2, 300 second archive interval.

use std::time::Duration;

use wxdaq::config::StationConfig;
use wxdaq::error::WxError;
use wxdaq::vantage::archive::{archive_words_to_epoch, ARCHIVE_RECORD_LEN};
use wxdaq::vantage::console::Console;
use wxdaq::vantage::crc16;
use wxdaq::vantage::loop_packet::LoopType;
use wxdaq::vantage::mock::MockOpener;
use wxdaq::vantage::ACK;

const WAKE: &[u8] = b"\n\r";

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

/// A complete 99-byte LOOP frame: 95-byte payload, LF CR, CRC over all 97.
fn loop_frame() -> Vec<u8> {
    let mut payload = vec![0xffu8; 95];
    payload[0..3].copy_from_slice(b"LOO");
    payload[3] = b'P';
    payload[4] = 0;
    payload[5..7].copy_from_slice(&0u16.to_le_bytes());
    payload[7..9].copy_from_slice(&30012u16.to_le_bytes()); // barometer
    payload[9..11].copy_from_slice(&710i16.to_le_bytes());
    payload[11] = 40;
    payload[12..14].copy_from_slice(&760i16.to_le_bytes()); // outTemp 76.0
    payload[14] = 5; // windSpeed
    payload[15] = 6;
    payload[16..18].copy_from_slice(&0x00b4u16.to_le_bytes()); // windDir 180
    payload[33] = 55; // outHumidity
    payload[41..43].copy_from_slice(&0u16.to_le_bytes());
    payload[44..46].copy_from_slice(&0x7fffu16.to_le_bytes());
    payload[46..48].copy_from_slice(&0u16.to_le_bytes());
    payload[48..50].copy_from_slice(&0xffffu16.to_le_bytes());
    for off in [50usize, 52, 54, 56, 58, 60] {
        payload[off..off + 2].copy_from_slice(&0u16.to_le_bytes());
    }
    for b in &mut payload[70..86] {
        *b = 0;
    }
    payload[86] = 0;
    payload[87..89].copy_from_slice(&800u16.to_le_bytes());
    payload[89] = 8;
    payload[90] = 45;
    payload[91..93].copy_from_slice(&617u16.to_le_bytes());
    payload[93..95].copy_from_slice(&1945u16.to_le_bytes());

    let mut frame = payload;
    frame.extend_from_slice(b"\n\r");
    let crc = crc16::crc16_be(&frame);
    frame.extend_from_slice(&crc);
    assert_eq!(frame.len(), 99);
    frame
}

/// A 52-byte Rev-B record with the given date/time words.
fn archive_slot(date_word: u16, time_word: u16) -> [u8; ARCHIVE_RECORD_LEN] {
    let mut buf = [0u8; ARCHIVE_RECORD_LEN];
    buf[0..2].copy_from_slice(&date_word.to_le_bytes());
    buf[2..4].copy_from_slice(&time_word.to_le_bytes());
    buf[4..6].copy_from_slice(&760i16.to_le_bytes());
    buf[6..8].copy_from_slice(&772i16.to_le_bytes());
    buf[8..10].copy_from_slice(&751i16.to_le_bytes());
    buf[10..12].copy_from_slice(&12u16.to_le_bytes());
    buf[12..14].copy_from_slice(&30u16.to_le_bytes());
    buf[14..16].copy_from_slice(&30012u16.to_le_bytes());
    buf[16..18].copy_from_slice(&640u16.to_le_bytes());
    buf[18..20].copy_from_slice(&700u16.to_le_bytes());
    buf[20..22].copy_from_slice(&710i16.to_le_bytes());
    buf[22] = 40;
    buf[23] = 55;
    buf[24] = 5;
    buf[25] = 12;
    buf[26] = 8;
    buf[27] = 8;
    buf[28] = 42;
    buf[29] = 11;
    buf[30..32].copy_from_slice(&800u16.to_le_bytes());
    buf[32] = 51;
    buf[33] = 45;
    for b in &mut buf[34..42] {
        *b = 0xff;
    }
    buf[42] = 0; // Rev-B
    for b in &mut buf[43..52] {
        *b = 0xff;
    }
    buf
}

/// An archive page: sequence byte, five slots (unused filled with 0xFF),
/// four unused octets, CRC over everything.
fn page(slots: &[[u8; ARCHIVE_RECORD_LEN]]) -> Vec<u8> {
    assert!(slots.len() <= 5);
    let mut body = vec![0xffu8; 265];
    body[0] = 0;
    for (i, slot) in slots.iter().enumerate() {
        body[1 + 52 * i..53 + 52 * i].copy_from_slice(slot);
    }
    framed(&body)
}

/// Date/time words for 2021-06-15 at the given hour and minute.
fn words(hour: u16, minute: u16) -> (u16, u16) {
    (15 | (6 << 5) | (21 << 9), hour * 100 + minute)
}

#[test]
fn loop_stream_decodes_and_cancels_on_drop() {
    let session = vec![WAKE.to_vec(), vec![ACK], loop_frame()];
    let (opener, written) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let mut stream = console.loop_stream();
    let packet = stream.next().unwrap().unwrap();
    assert_eq!(packet.loop_type, LoopType::A);
    assert_eq!(packet.out_temp, Some(76.0));
    assert_eq!(packet.out_humidity, Some(55.0));
    assert_eq!(packet.wind_speed, Some(5.0));
    assert_eq!(packet.wind_dir, Some(180.0));
    assert_eq!(packet.barometer, Some(30.012));
    assert!(packet.dewpoint.is_some());
    assert!(packet.heatindex.is_some());
    assert!(packet.windchill.is_some());

    // Dropping the stream mid-quota releases the port; the release emits
    // the wake-up nudge that cancels the console's remaining packets.
    drop(stream);
    let log = written.lock().unwrap();
    assert!(log.iter().any(|w| w == b"LOOP 200\n"));
    assert_eq!(log.last().map(Vec::as_slice), Some(&b"\n"[..]));
}

#[test]
fn dump_since_epoch_zero_sends_zero_datestamp() {
    let (date1, time1) = words(12, 5);
    let header = framed(&[1, 0, 0, 0]);
    let session = vec![
        WAKE.to_vec(),
        vec![ACK], // DMPAFT
        vec![ACK], // datestamp block
        header,
        page(&[archive_slot(date1, time1)]),
    ];
    let (opener, written) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let records: Vec<_> = console
        .archive_dump(0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].date_time,
        archive_words_to_epoch(date1, time1)
    );
    assert_eq!(records[0].interval, 5);
    assert_eq!(records[0].model_type, 2);
    assert_eq!(records[0].iss_id, 1);

    // since_ts = 0 encodes as four zero bytes plus their CRC.
    let expected = framed(&[0, 0, 0, 0]);
    let log = written.lock().unwrap();
    assert!(log.iter().any(|w| *w == expected));
}

#[test]
fn dump_terminates_at_unused_slot() {
    let (date, _) = words(12, 0);
    let header = framed(&[2, 0, 0, 0]);
    let session = vec![
        WAKE.to_vec(),
        vec![ACK],
        vec![ACK],
        header,
        // Third slot untouched (all 0xFF): dump ends after two records,
        // without requesting the second page.
        page(&[archive_slot(date, 1205), archive_slot(date, 1210)]),
    ];
    let (opener, _) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let mut dump = console.archive_dump(0).unwrap();
    assert!(dump.next().unwrap().is_ok());
    assert!(dump.next().unwrap().is_ok());
    assert!(dump.next().is_none());
}

#[test]
fn dump_allows_dst_slip_but_not_wraparound() {
    let header = framed(&[1, 0, 0, 0]);
    let (date, _) = words(12, 0);
    let session = vec![
        WAKE.to_vec(),
        vec![ACK],
        vec![ACK],
        header,
        page(&[
            archive_slot(date, 1200),          // T
            archive_slot(date, 1205),          // T + 300
            archive_slot(date, 1210),          // T + 600
            archive_slot(date, 1140),          // T - 1200: within DST slack
            archive_slot(date, 1036),          // T - 5040: wrap-around
        ]),
    ];
    let (opener, _) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let records: Vec<_> = console
        .archive_dump(0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let times: Vec<i64> = records.iter().filter_map(|r| r.date_time).collect();
    assert_eq!(
        times,
        vec![
            archive_words_to_epoch(date, 1200).unwrap(),
            archive_words_to_epoch(date, 1205).unwrap(),
            archive_words_to_epoch(date, 1210).unwrap(),
            archive_words_to_epoch(date, 1140).unwrap(),
        ]
    );
}

#[test]
fn dump_retries_from_scratch_after_transport_fault() {
    let (date, _) = words(12, 0);
    let header = framed(&[1, 0, 0, 0]);
    let good_page = page(&[archive_slot(date, 1205)]);
    let mut bad_page = good_page.clone();
    bad_page[5] ^= 0xff;

    // First pass dies on a corrupt page (every resend returns the same bad
    // bytes); the dump restarts with a fresh DMPAFT and succeeds.
    let session = vec![
        WAKE.to_vec(),
        vec![ACK],
        vec![ACK],
        header.clone(),
        bad_page.clone(),
        bad_page.clone(),
        bad_page.clone(),
        bad_page,
        // retry: wake, DMPAFT, datestamp, header, good page
        WAKE.to_vec(),
        vec![ACK],
        vec![ACK],
        header,
        good_page,
    ];
    let (opener, _) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let records: Vec<_> = console
        .archive_dump(0)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
}

#[test]
fn dump_aborts_on_unknown_record_type() {
    let (date, _) = words(12, 0);
    let mut rev_a = archive_slot(date, 1205);
    rev_a[42] = 0x01;
    let header = framed(&[1, 0, 0, 0]);
    let session = vec![
        WAKE.to_vec(),
        vec![ACK],
        vec![ACK],
        header,
        page(&[rev_a]),
    ];
    let (opener, _) = MockOpener::new(vec![session]);
    let mut console = Console::new(station(), opener, 300);

    let mut dump = console.archive_dump(0).unwrap();
    let err = dump.next().unwrap().unwrap_err();
    assert!(matches!(err, WxError::UnknownArchiveType(0x01)));
    assert!(dump.next().is_none());
}
