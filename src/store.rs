//! Store interfaces consumed by the engine.
//!
//! The SQL-backed archive table and the derived statistics store live
//! outside this crate; the engine only needs the newest persisted
//! timestamp, row insertion, and a scan for backfilling stats. The
//! in-memory implementations back the tests and the default wiring.

use chrono::{Local, TimeZone};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{WxError, WxResult};
use crate::vantage::archive::ArchiveRecord;

/// Archive table keyed by `date_time` (epoch seconds).
pub trait ArchiveStore: Send + Sync {
    /// Newest persisted timestamp, or `None` for an empty archive.
    fn last_timestamp(&self) -> WxResult<Option<i64>>;

    /// Insert one record. Records without a timestamp are rejected.
    fn insert(&self, record: &ArchiveRecord) -> WxResult<()>;

    /// Fetch one record by its timestamp.
    fn get(&self, ts: i64) -> WxResult<Option<ArchiveRecord>>;

    /// All records strictly after `since_ts`, in timestamp order.
    fn records_since(&self, since_ts: i64) -> WxResult<Vec<ArchiveRecord>>;
}

/// Aggregated highs/lows by day.
pub trait StatsStore: Send + Sync {
    fn update(&self, record: &ArchiveRecord) -> WxResult<()>;
}

#[derive(Default)]
pub struct MemoryArchiveStore {
    records: Mutex<BTreeMap<i64, ArchiveRecord>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_err() -> WxError {
    WxError::Store("store mutex poisoned".to_string())
}

impl ArchiveStore for MemoryArchiveStore {
    fn last_timestamp(&self) -> WxResult<Option<i64>> {
        let records = self.records.lock().map_err(|_| lock_err())?;
        Ok(records.keys().next_back().copied())
    }

    fn insert(&self, record: &ArchiveRecord) -> WxResult<()> {
        let ts = record
            .date_time
            .ok_or_else(|| WxError::Store("archive record has no dateTime".to_string()))?;
        let mut records = self.records.lock().map_err(|_| lock_err())?;
        if records.insert(ts, record.clone()).is_some() {
            debug!("Replaced archive record at {}", ts);
        }
        Ok(())
    }

    fn get(&self, ts: i64) -> WxResult<Option<ArchiveRecord>> {
        let records = self.records.lock().map_err(|_| lock_err())?;
        Ok(records.get(&ts).cloned())
    }

    fn records_since(&self, since_ts: i64) -> WxResult<Vec<ArchiveRecord>> {
        let records = self.records.lock().map_err(|_| lock_err())?;
        Ok(records
            .range(since_ts + 1..)
            .map(|(_, rec)| rec.clone())
            .collect())
    }
}

/// Daily aggregates for the observations the stats pages need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayStats {
    pub high_out_temp: Option<f64>,
    pub low_out_temp: Option<f64>,
    pub rain_total: f64,
    pub high_wind_gust: Option<f64>,
}

#[derive(Default)]
pub struct MemoryStatsStore {
    days: Mutex<HashMap<String, DayStats>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn day(&self, key: &str) -> Option<DayStats> {
        self.days.lock().ok()?.get(key).cloned()
    }
}

fn day_key(ts: i64) -> Option<String> {
    match Local.timestamp_opt(ts, 0) {
        chrono::offset::LocalResult::Single(dt)
        | chrono::offset::LocalResult::Ambiguous(dt, _) => Some(dt.format("%Y-%m-%d").to_string()),
        chrono::offset::LocalResult::None => None,
    }
}

fn max_opt(current: Option<f64>, candidate: f64) -> Option<f64> {
    Some(current.map_or(candidate, |v| v.max(candidate)))
}

fn min_opt(current: Option<f64>, candidate: f64) -> Option<f64> {
    Some(current.map_or(candidate, |v| v.min(candidate)))
}

impl StatsStore for MemoryStatsStore {
    fn update(&self, record: &ArchiveRecord) -> WxResult<()> {
        let Some(ts) = record.date_time else {
            return Ok(());
        };
        let Some(key) = day_key(ts) else {
            return Ok(());
        };
        let mut days = self.days.lock().map_err(|_| lock_err())?;
        let day = days.entry(key).or_default();
        if let Some(high) = record.high_out_temp.or(record.out_temp) {
            day.high_out_temp = max_opt(day.high_out_temp, high);
        }
        if let Some(low) = record.low_out_temp.or(record.out_temp) {
            day.low_out_temp = min_opt(day.low_out_temp, low);
        }
        if let Some(rain) = record.rain {
            day.rain_total += rain;
        }
        if let Some(gust) = record.wind_gust {
            day.high_wind_gust = max_opt(day.high_wind_gust, gust);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vantage::archive::tests::{ctx, sample_raw};
    use crate::vantage::archive::translate_archive_packet;

    fn record(ts: i64) -> ArchiveRecord {
        let mut rec = translate_archive_packet(&sample_raw(), &ctx()).unwrap();
        rec.date_time = Some(ts);
        rec
    }

    #[test]
    fn test_archive_ordering_and_last_timestamp() {
        let store = MemoryArchiveStore::new();
        assert_eq!(store.last_timestamp().unwrap(), None);

        store.insert(&record(900)).unwrap();
        store.insert(&record(300)).unwrap();
        store.insert(&record(600)).unwrap();

        assert_eq!(store.last_timestamp().unwrap(), Some(900));
        let since: Vec<i64> = store
            .records_since(300)
            .unwrap()
            .iter()
            .filter_map(|r| r.date_time)
            .collect();
        assert_eq!(since, vec![600, 900]);
    }

    #[test]
    fn test_insert_without_timestamp_rejected() {
        let store = MemoryArchiveStore::new();
        let mut rec = record(0);
        rec.date_time = None;
        assert!(store.insert(&rec).is_err());
    }

    #[test]
    fn test_stats_daily_aggregation() {
        let stats = MemoryStatsStore::new();
        let ts = 1_623_769_500; // some instant; both records land on its day
        let mut first = record(ts);
        first.high_out_temp = Some(77.2);
        first.low_out_temp = Some(75.1);
        first.rain = Some(0.12);
        let mut second = record(ts + 300);
        second.high_out_temp = Some(79.0);
        second.low_out_temp = Some(74.0);
        second.rain = Some(0.02);

        stats.update(&first).unwrap();
        stats.update(&second).unwrap();

        let key = day_key(ts).unwrap();
        let day = stats.day(&key).unwrap();
        assert_eq!(day.high_out_temp, Some(79.0));
        assert_eq!(day.low_out_temp, Some(74.0));
        assert!((day.rain_total - 0.14).abs() < 1e-9);
    }
}
