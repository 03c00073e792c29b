//! Archive record decoding and the VP date/time word codecs.
//!
//! The console stores history as 52-octet Rev-B records, five to a
//! 267-octet page. Dates are bitpacked words, times are hour*100+minute,
//! and both convert to host epochs through the local timezone the same way
//! the console's own clock is read.

use chrono::offset::LocalResult;
use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};
use serde::Serialize;

use crate::error::{WxError, WxResult};
use crate::vantage::values;
use crate::vantage::US_UNITS;
use crate::wxformulas;

/// Rev-B record length.
pub const ARCHIVE_RECORD_LEN: usize = 52;
/// Archive page length on the wire: sequence byte, five records, four
/// unused octets, trailing CRC. The CRC covers the whole page.
pub const ARCHIVE_PAGE_LEN: usize = 267;
/// Records per page.
pub const RECORDS_PER_PAGE: usize = 5;

/// A Rev-B archive record in the console's internal encoding.
#[derive(Debug, Clone)]
pub struct RawArchivePacket {
    pub date_stamp: u16,
    pub time_stamp: u16,
    pub out_temp: i16,
    pub high_out_temp: i16,
    pub low_out_temp: i16,
    pub rain: u16,
    pub high_rain_rate: u16,
    pub barometer: u16,
    pub radiation: u16,
    pub wind_samples: u16,
    pub in_temp: i16,
    pub in_humidity: u8,
    pub out_humidity: u8,
    pub wind_speed: u8,
    pub high_wind_speed: u8,
    pub high_wind_dir: u8,
    pub prevailing_wind_dir: u8,
    pub uv: u8,
    pub et: u8,
    pub high_radiation: u16,
    pub high_uv: u8,
    pub forecast_rule: u8,
    pub leaf_temp: [u8; 2],
    pub leaf_wet: [u8; 2],
    pub soil_temp: [u8; 4],
    pub extra_humid: [u8; 2],
    pub extra_temp: [u8; 3],
    pub soil_moist: [u8; 4],
}

/// An archive record in physical US units, with the per-dump metadata the
/// driver attaches and the accumulator-derived fields merged in.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    /// Local epoch seconds of the end of the archive interval; `None` if
    /// the packed date/time do not name a real local instant.
    pub date_time: Option<i64>,
    pub us_units: u8,
    /// Archive interval in minutes.
    pub interval: u32,
    pub model_type: u32,
    pub iss_id: u32,
    /// Estimated ISS reception percentage over the interval.
    pub rx_check_percent: Option<f64>,
    pub out_temp: Option<f64>,
    pub high_out_temp: Option<f64>,
    pub low_out_temp: Option<f64>,
    pub rain: Option<f64>,
    pub rain_rate: Option<f64>,
    pub barometer: Option<f64>,
    pub radiation: Option<f64>,
    pub high_radiation: Option<f64>,
    pub wind_samples: u16,
    pub in_temp: Option<f64>,
    pub in_humidity: Option<f64>,
    pub out_humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_gust: Option<f64>,
    pub wind_gust_dir: Option<f64>,
    pub wind_dir: Option<f64>,
    pub uv: Option<f64>,
    pub high_uv: Option<f64>,
    pub et: Option<f64>,
    pub forecast_rule: u8,
    pub leaf_temp: [Option<f64>; 2],
    pub leaf_wet: [Option<f64>; 2],
    pub soil_temp: [Option<f64>; 4],
    pub extra_humid: [Option<f64>; 2],
    pub extra_temp: [Option<f64>; 3],
    pub soil_moist: [Option<f64>; 4],
    /// Sticky OR of every transmitter battery bitmap seen over the
    /// interval; merged from the accumulators.
    pub tx_battery_status: Option<u8>,
    /// Interval average console battery voltage; merged from the
    /// accumulators.
    pub cons_battery_voltage: Option<f64>,
    pub dewpoint: Option<f64>,
    pub heatindex: Option<f64>,
    pub windchill: Option<f64>,
}

/// Metadata the driver attaches to every record of a dump.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveContext {
    pub interval_secs: u32,
    pub model_type: u32,
    pub iss_id: u32,
    pub unit_system: u8,
}

fn u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn i16_at(buf: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn bytes_at<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// Whether a 52-octet page slot has never been written.
pub fn is_unused_slot(slot: &[u8]) -> bool {
    slot.iter().all(|&b| b == 0xff)
}

/// Decode a 52-octet Rev-B record. The record-type byte must be zero;
/// anything else (including a Rev-A record) is rejected.
pub fn unpack_archive_packet(buf: &[u8]) -> WxResult<RawArchivePacket> {
    if buf.len() < ARCHIVE_RECORD_LEN {
        return Err(WxError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("archive record too short: {} bytes", buf.len()),
        )));
    }
    let record_type = buf[42];
    if record_type != 0 {
        return Err(WxError::UnknownArchiveType(record_type));
    }

    Ok(RawArchivePacket {
        date_stamp: u16_at(buf, 0),
        time_stamp: u16_at(buf, 2),
        out_temp: i16_at(buf, 4),
        high_out_temp: i16_at(buf, 6),
        low_out_temp: i16_at(buf, 8),
        rain: u16_at(buf, 10),
        high_rain_rate: u16_at(buf, 12),
        barometer: u16_at(buf, 14),
        radiation: u16_at(buf, 16),
        wind_samples: u16_at(buf, 18),
        in_temp: i16_at(buf, 20),
        in_humidity: buf[22],
        out_humidity: buf[23],
        wind_speed: buf[24],
        high_wind_speed: buf[25],
        high_wind_dir: buf[26],
        prevailing_wind_dir: buf[27],
        uv: buf[28],
        et: buf[29],
        high_radiation: u16_at(buf, 30),
        high_uv: buf[32],
        forecast_rule: buf[33],
        leaf_temp: bytes_at(buf, 34),
        leaf_wet: bytes_at(buf, 36),
        soil_temp: bytes_at(buf, 38),
        extra_humid: bytes_at(buf, 43),
        extra_temp: bytes_at(buf, 45),
        soil_moist: bytes_at(buf, 48),
    })
}

/// Translate a raw archive record to physical units under the given dump
/// context.
pub fn translate_archive_packet(
    raw: &RawArchivePacket,
    ctx: &ArchiveContext,
) -> WxResult<ArchiveRecord> {
    if ctx.unit_system != US_UNITS {
        return Err(WxError::UnsupportedFeature(
            "only US customary units are supported on the Davis VP2".to_string(),
        ));
    }

    let interval_minutes = ctx.interval_secs / 60;
    let out_temp = values::big_val10(raw.out_temp);
    let out_humidity = values::little_val(raw.out_humidity);
    let wind_speed = values::little_val(raw.wind_speed);

    let dewpoint = match (out_temp, out_humidity) {
        (Some(t), Some(rh)) => wxformulas::dewpoint_f(t, rh),
        _ => None,
    };
    let heatindex = match (out_temp, out_humidity) {
        (Some(t), Some(rh)) => Some(wxformulas::heatindex_f(t, rh)),
        _ => None,
    };
    let windchill = match (out_temp, wind_speed) {
        (Some(t), Some(v)) => Some(wxformulas::windchill_f(t, v)),
        _ => None,
    };

    Ok(ArchiveRecord {
        date_time: archive_words_to_epoch(raw.date_stamp, raw.time_stamp),
        us_units: US_UNITS,
        interval: interval_minutes,
        model_type: ctx.model_type,
        iss_id: ctx.iss_id,
        rx_check_percent: rx_check_percent(
            ctx.model_type,
            interval_minutes,
            ctx.iss_id,
            raw.wind_samples,
        ),
        out_temp,
        high_out_temp: values::big_val10(raw.high_out_temp),
        low_out_temp: values::big_val10(raw.low_out_temp),
        rain: values::val100(raw.rain),
        rain_rate: values::val100(raw.high_rain_rate),
        barometer: values::val1000_zero(raw.barometer),
        radiation: values::big_val(raw.radiation),
        high_radiation: values::big_val(raw.high_radiation),
        wind_samples: raw.wind_samples,
        in_temp: values::big_val10(raw.in_temp),
        in_humidity: values::little_val(raw.in_humidity),
        out_humidity,
        wind_speed,
        wind_gust: values::little_val(raw.high_wind_speed),
        wind_gust_dir: values::wind_dir16(raw.high_wind_dir),
        wind_dir: values::wind_dir16(raw.prevailing_wind_dir),
        uv: values::little_val10(raw.uv),
        high_uv: values::little_val10(raw.high_uv),
        et: values::val1000(raw.et as u16),
        forecast_rule: raw.forecast_rule,
        leaf_temp: raw.leaf_temp.map(values::little_temp),
        leaf_wet: raw.leaf_wet.map(values::little_val),
        soil_temp: raw.soil_temp.map(values::little_temp),
        extra_humid: raw.extra_humid.map(values::little_val),
        extra_temp: raw.extra_temp.map(values::little_temp),
        soil_moist: raw.soil_moist.map(values::little_val),
        tx_battery_status: None,
        cons_battery_voltage: None,
        dewpoint,
        heatindex,
        windchill,
    })
}

/// Expected ISS reception percentage from the observed wind-sample count.
///
/// The expected-packet formula differs by console model. The model-1
/// variant is carried over from field-collected folklore and has never
/// been exercised against captured traffic.
pub fn rx_check_percent(
    model_type: u32,
    interval_minutes: u32,
    iss_id: u32,
    wind_samples: u16,
) -> Option<f64> {
    let interval = interval_minutes as f64;
    let iss = iss_id as f64;
    let expected = match model_type {
        1 => {
            36.0 * interval / (2.5 + (iss - 1.0) / 16.0)
                - 0.68 * interval * (1.0 - 1.0 / (10.24 - (iss - 1.0) * 0.64))
        }
        2 => 960.0 * interval / (41.0 + iss - 1.0),
        _ => return None,
    };
    if expected <= 0.0 {
        return None;
    }
    let frac = wind_samples as f64 * 100.0 / expected;
    Some(frac.min(100.0))
}

/// Convert a local naive date+time to epoch seconds. Ambiguous instants
/// (DST fall-back) resolve to the earliest mapping, the way `mktime` does
/// with an unknown DST flag; nonexistent instants yield `None`.
pub(crate) fn local_to_epoch(naive: chrono::NaiveDateTime) -> Option<i64> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.timestamp()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.timestamp()),
        LocalResult::None => None,
    }
}

/// Decode the archive date word (`day | month<<5 | (year-2000)<<9`) and
/// time word (`hour*100 + minute`) to a local epoch.
pub fn archive_words_to_epoch(date_word: u16, time_word: u16) -> Option<i64> {
    if date_word == 0xffff || time_word == 0xffff {
        return None;
    }
    let year = ((date_word >> 9) & 0x7f) as i32 + 2000;
    let month = ((date_word >> 5) & 0x0f) as u32;
    let day = (date_word & 0x1f) as u32;
    let hour = (time_word / 100) as u32;
    let minute = (time_word % 100) as u32;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    local_to_epoch(naive)
}

/// Encode an epoch into the `DMPAFT` date and time words. Zero (or a
/// negative epoch) encodes as `(0, 0)`, which asks for everything.
pub fn epoch_to_archive_words(since_ts: i64) -> (u16, u16) {
    if since_ts <= 0 {
        return (0, 0);
    }
    match Local.timestamp_opt(since_ts, 0) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
            let date_word = dt.day() as u16
                | (dt.month() as u16) << 5
                | ((dt.year() - 2000).clamp(0, 127) as u16) << 9;
            let time_word = dt.hour() as u16 * 100 + dt.minute() as u16;
            (date_word, time_word)
        }
        LocalResult::None => (0, 0),
    }
}

/// Decode a LOOP-format date word (storm start) to local midnight epoch.
/// Layout differs from the archive word: `year-2000` in the low bits.
pub fn loop_date_to_epoch(word: u16) -> Option<i64> {
    if word == 0xffff {
        return None;
    }
    let year = (word & 0x7f) as i32 + 2000;
    let month = ((word >> 12) & 0x0f) as u32;
    let day = ((word >> 7) & 0x1f) as u32;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?;
    local_to_epoch(naive)
}
