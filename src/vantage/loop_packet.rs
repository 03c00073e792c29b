//! LOOP frame decoding.
//!
//! A LOOP frame is 99 octets: the magic `"LOO"`, a loop-type byte, the
//! sensor payload, LF CR, and a trailing CRC-16 over everything before it.
//! Byte 3 distinguishes the two revisions: an ASCII `'P'` marks the
//! original type-A frame; anything else is a type-B frame and the byte is
//! the signed 3-hour barometer trend.

use serde::Serialize;

use crate::error::{WxError, WxResult};
use crate::vantage::values;
use crate::vantage::US_UNITS;
use crate::wxformulas;

/// Full frame length on the wire, CRC included.
pub const LOOP_FRAME_LEN: usize = 99;
/// Payload length the decoder consumes (frame minus LF CR CRC).
pub const LOOP_PAYLOAD_LEN: usize = 95;

/// Loop frame revision tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopType {
    /// Original frame, no barometer trend.
    A,
    /// Rev-B frame carrying the signed 3-hour barometer trend.
    B { trend: i8 },
}

/// A LOOP frame in the console's internal encoding.
#[derive(Debug, Clone)]
pub struct RawLoopPacket {
    pub loop_type: LoopType,
    pub packet_type: u8,
    pub next_record: u16,
    pub barometer: u16,
    pub in_temp: i16,
    pub in_humidity: u8,
    pub out_temp: i16,
    pub wind_speed: u8,
    pub wind_speed10: u8,
    pub wind_dir: u16,
    pub extra_temp: [u8; 7],
    pub soil_temp: [u8; 4],
    pub leaf_temp: [u8; 4],
    pub out_humidity: u8,
    pub extra_humid: [u8; 7],
    pub rain_rate: u16,
    pub uv: u8,
    pub radiation: u16,
    pub storm_rain: u16,
    pub storm_start: u16,
    pub day_rain: u16,
    pub month_rain: u16,
    pub year_rain: u16,
    pub day_et: u16,
    pub month_et: u16,
    pub year_et: u16,
    pub soil_moist: [u8; 4],
    pub leaf_wet: [u8; 4],
    pub inside_alarm: u8,
    pub rain_alarm: u8,
    pub outside_alarm1: u8,
    pub outside_alarm2: u8,
    pub extra_alarm: [u8; 8],
    pub soil_leaf_alarm: [u8; 4],
    pub tx_battery_status: u8,
    pub cons_battery_voltage: u16,
    pub forecast_icon: u8,
    pub forecast_rule: u8,
    pub sunrise: u16,
    pub sunset: u16,
}

/// A LOOP observation in physical US units. Absent sensors decode to
/// `None`; alarm bitmaps and forecast codes stay raw.
#[derive(Debug, Clone, Serialize)]
pub struct LoopRecord {
    /// Host epoch seconds at decode time.
    pub date_time: i64,
    pub us_units: u8,
    pub loop_type: LoopType,
    pub barometer: Option<f64>,
    pub in_temp: Option<f64>,
    pub in_humidity: Option<f64>,
    pub out_temp: Option<f64>,
    pub out_humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_speed10: Option<f64>,
    pub wind_dir: Option<f64>,
    pub extra_temp: [Option<f64>; 7],
    pub soil_temp: [Option<f64>; 4],
    pub leaf_temp: [Option<f64>; 4],
    pub extra_humid: [Option<f64>; 7],
    pub rain_rate: Option<f64>,
    pub uv: Option<f64>,
    pub radiation: Option<f64>,
    pub storm_rain: Option<f64>,
    /// Local epoch of the start of the current storm.
    pub storm_start: Option<i64>,
    pub day_rain: Option<f64>,
    pub month_rain: Option<f64>,
    pub year_rain: Option<f64>,
    pub day_et: Option<f64>,
    pub month_et: Option<f64>,
    pub year_et: Option<f64>,
    pub soil_moist: [Option<f64>; 4],
    pub leaf_wet: [Option<f64>; 4],
    pub inside_alarm: u8,
    pub rain_alarm: u8,
    pub outside_alarm1: u8,
    pub outside_alarm2: u8,
    pub extra_alarm: [u8; 8],
    pub soil_leaf_alarm: [u8; 4],
    pub tx_battery_status: u8,
    pub cons_battery_voltage: Option<f64>,
    pub forecast_icon: u8,
    pub forecast_rule: u8,
    /// Minutes after local midnight.
    pub sunrise: Option<u32>,
    pub sunset: Option<u32>,
    pub dewpoint: Option<f64>,
    pub heatindex: Option<f64>,
    pub windchill: Option<f64>,
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

/// Decode the first 95 octets of a CRC-valid LOOP frame.
pub fn unpack_loop_packet(buf: &[u8]) -> WxResult<RawLoopPacket> {
    if buf.len() < LOOP_PAYLOAD_LEN {
        return Err(WxError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("LOOP payload too short: {} bytes", buf.len()),
        )));
    }
    if &buf[0..3] != b"LOO" {
        return Err(WxError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad LOOP magic {:02x?}", &buf[0..3]),
        )));
    }

    let loop_type = if buf[3] == b'P' {
        LoopType::A
    } else {
        LoopType::B {
            trend: buf[3] as i8,
        }
    };

    Ok(RawLoopPacket {
        loop_type,
        packet_type: buf[4],
        next_record: u16_at(buf, 5),
        barometer: u16_at(buf, 7),
        in_temp: i16_at(buf, 9),
        in_humidity: buf[11],
        out_temp: i16_at(buf, 12),
        wind_speed: buf[14],
        wind_speed10: buf[15],
        wind_dir: u16_at(buf, 16),
        extra_temp: bytes_at(buf, 18),
        soil_temp: bytes_at(buf, 25),
        leaf_temp: bytes_at(buf, 29),
        out_humidity: buf[33],
        extra_humid: bytes_at(buf, 34),
        rain_rate: u16_at(buf, 41),
        uv: buf[43],
        radiation: u16_at(buf, 44),
        storm_rain: u16_at(buf, 46),
        storm_start: u16_at(buf, 48),
        day_rain: u16_at(buf, 50),
        month_rain: u16_at(buf, 52),
        year_rain: u16_at(buf, 54),
        day_et: u16_at(buf, 56),
        month_et: u16_at(buf, 58),
        year_et: u16_at(buf, 60),
        soil_moist: bytes_at(buf, 62),
        leaf_wet: bytes_at(buf, 66),
        inside_alarm: buf[70],
        rain_alarm: buf[71],
        outside_alarm1: buf[72],
        outside_alarm2: buf[73],
        extra_alarm: bytes_at(buf, 74),
        soil_leaf_alarm: bytes_at(buf, 82),
        tx_battery_status: buf[86],
        cons_battery_voltage: u16_at(buf, 87),
        forecast_icon: buf[89],
        forecast_rule: buf[90],
        sunrise: u16_at(buf, 91),
        sunset: u16_at(buf, 93),
    })
}

/// Decode an hour*100+minute word to minutes after midnight.
fn hhmm(v: u16) -> Option<u32> {
    if v == 0x7fff || v == 0xffff {
        return None;
    }
    let (h, m) = (v / 100, v % 100);
    (h <= 23 && m <= 59).then_some(h as u32 * 60 + m as u32)
}

/// Translate a raw LOOP packet to physical US units, stamped with the
/// host clock and enriched with derived quantities.
pub fn translate_loop_packet(
    raw: &RawLoopPacket,
    unit_system: u8,
    now_ts: i64,
) -> WxResult<LoopRecord> {
    if unit_system != US_UNITS {
        return Err(WxError::UnsupportedFeature(
            "only US customary units are supported on the Davis VP2".to_string(),
        ));
    }

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

    Ok(LoopRecord {
        date_time: now_ts,
        us_units: US_UNITS,
        loop_type: raw.loop_type,
        barometer: values::val1000_zero(raw.barometer),
        in_temp: values::big_val10(raw.in_temp),
        in_humidity: values::little_val(raw.in_humidity),
        out_temp,
        out_humidity,
        wind_speed,
        wind_speed10: values::little_val(raw.wind_speed10),
        wind_dir: values::big_val(raw.wind_dir),
        extra_temp: raw.extra_temp.map(values::little_temp),
        soil_temp: raw.soil_temp.map(values::little_temp),
        leaf_temp: raw.leaf_temp.map(values::little_temp),
        extra_humid: raw.extra_humid.map(values::little_val),
        rain_rate: values::val100(raw.rain_rate),
        uv: values::little_val10(raw.uv),
        radiation: values::big_val(raw.radiation),
        storm_rain: values::val100(raw.storm_rain),
        storm_start: super::archive::loop_date_to_epoch(raw.storm_start),
        day_rain: values::val100(raw.day_rain),
        month_rain: values::val100(raw.month_rain),
        year_rain: values::val100(raw.year_rain),
        day_et: values::val1000(raw.day_et),
        month_et: values::val100(raw.month_et),
        year_et: values::val100(raw.year_et),
        soil_moist: raw.soil_moist.map(values::little_val),
        leaf_wet: raw.leaf_wet.map(values::little_val),
        inside_alarm: raw.inside_alarm,
        rain_alarm: raw.rain_alarm,
        outside_alarm1: raw.outside_alarm1,
        outside_alarm2: raw.outside_alarm2,
        extra_alarm: raw.extra_alarm,
        soil_leaf_alarm: raw.soil_leaf_alarm,
        tx_battery_status: raw.tx_battery_status,
        cons_battery_voltage: values::cons_battery_voltage(raw.cons_battery_voltage),
        forecast_icon: raw.forecast_icon,
        forecast_rule: raw.forecast_rule,
        sunrise: hhmm(raw.sunrise),
        sunset: hhmm(raw.sunset),
        dewpoint,
        heatindex,
        windchill,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a LOOP payload with realistic field values for the decode
    /// scenario: type A, outTemp 76.0 F, outHumidity 55%, windSpeed 5 mph,
    /// windDir 180, barometer 30.012 inHg.
    pub(crate) fn sample_payload() -> Vec<u8> {
        let mut buf = vec![0xffu8; LOOP_PAYLOAD_LEN];
        buf[0..3].copy_from_slice(b"LOO");
        buf[3] = b'P';
        buf[4] = 0;
        buf[5..7].copy_from_slice(&0u16.to_le_bytes());
        buf[7..9].copy_from_slice(&30012u16.to_le_bytes());
        buf[9..11].copy_from_slice(&710i16.to_le_bytes()); // inTemp 71.0
        buf[11] = 40; // inHumidity
        buf[12..14].copy_from_slice(&760i16.to_le_bytes()); // outTemp 76.0
        buf[14] = 5; // windSpeed
        buf[15] = 6; // windSpeed10
        buf[16..18].copy_from_slice(&0x00b4u16.to_le_bytes()); // windDir 180
        buf[33] = 55; // outHumidity
        buf[41..43].copy_from_slice(&0u16.to_le_bytes()); // rainRate
        buf[43] = 0xff; // UV dashed
        buf[44..46].copy_from_slice(&0x7fffu16.to_le_bytes()); // radiation dashed
        buf[46..48].copy_from_slice(&0u16.to_le_bytes()); // stormRain
        buf[48..50].copy_from_slice(&0xffffu16.to_le_bytes()); // no storm
        for off in [50usize, 52, 54, 56, 58, 60] {
            buf[off..off + 2].copy_from_slice(&0u16.to_le_bytes());
        }
        for b in &mut buf[70..86] {
            *b = 0; // no alarms
        }
        buf[86] = 0; // txBatteryStatus
        buf[87..89].copy_from_slice(&800u16.to_le_bytes()); // 4.68 V
        buf[89] = 8;
        buf[90] = 45;
        buf[91..93].copy_from_slice(&617u16.to_le_bytes()); // sunrise 06:17
        buf[93..95].copy_from_slice(&1945u16.to_le_bytes()); // sunset 19:45
        buf
    }

    #[test]
    fn test_loop_decode_scenario() {
        let raw = unpack_loop_packet(&sample_payload()).unwrap();
        assert_eq!(raw.loop_type, LoopType::A);
        let rec = translate_loop_packet(&raw, US_UNITS, 1_700_000_000).unwrap();

        assert_eq!(rec.out_temp, Some(76.0));
        assert_eq!(rec.out_humidity, Some(55.0));
        assert_eq!(rec.wind_speed, Some(5.0));
        assert_eq!(rec.wind_dir, Some(180.0));
        assert_eq!(rec.barometer, Some(30.012));
        assert_eq!(rec.us_units, US_UNITS);
        // Derived fields follow from outdoor temperature/humidity/wind.
        assert!(rec.dewpoint.is_some());
        assert_eq!(rec.heatindex, Some(76.0));
        assert_eq!(rec.windchill, Some(76.0));
        // Dashed sensors are absent, not zero.
        assert_eq!(rec.uv, None);
        assert_eq!(rec.radiation, None);
        assert_eq!(rec.extra_temp[0], None);
        assert_eq!(rec.sunrise, Some(6 * 60 + 17));
    }

    #[test]
    fn test_loop_type_b_trend() {
        let mut payload = sample_payload();
        payload[3] = (-20i8) as u8;
        let raw = unpack_loop_packet(&payload).unwrap();
        assert_eq!(raw.loop_type, LoopType::B { trend: -20 });
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut payload = sample_payload();
        payload[0] = b'X';
        assert!(unpack_loop_packet(&payload).is_err());
    }

    #[test]
    fn test_non_us_units_rejected() {
        let raw = unpack_loop_packet(&sample_payload()).unwrap();
        let err = translate_loop_packet(&raw, 16, 0).unwrap_err();
        assert!(matches!(err, WxError::UnsupportedFeature(_)));
    }
}
