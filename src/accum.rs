//! Per-interval accumulators bridging LOOP samples into archive records.
//!
//! The console computes most archive fields itself; the driver derives the
//! rest from the live stream. Each accumulator is bound to one observation
//! and one archive-aligned interval `[start, stop)`. The pair of sets
//! (`current`, `last`) rolls over at the first sample past the boundary,
//! and `last` is merged into the archive record whose `date_time` equals
//! its `stop` so a restart can never smear averages across intervals.
//!
//! Today only console battery voltage flows through here; stations without
//! onboard archive storage would widen the observation list.

use crate::vantage::archive::ArchiveRecord;
use crate::vantage::loop_packet::LoopRecord;

/// Observation types derived from LOOP data instead of console archive
/// memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    ConsBatteryVoltage,
}

impl Observation {
    /// Everything the accumulator layer derives today.
    pub const DERIVED: &'static [Observation] = &[Observation::ConsBatteryVoltage];

    fn extract(&self, rec: &LoopRecord) -> Option<f64> {
        match self {
            Observation::ConsBatteryVoltage => rec.cons_battery_voltage,
        }
    }

    fn merge(&self, avg: f64, rec: &mut ArchiveRecord) {
        match self {
            Observation::ConsBatteryVoltage => rec.cons_battery_voltage = Some(avg),
        }
    }
}

/// Half-open interval `[start, stop)` in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: i64,
    pub stop: i64,
}

impl TimeSpan {
    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts < self.stop
    }
}

/// Running sum/count for one observation over one interval.
#[derive(Debug, Clone)]
pub struct Accumulator {
    obs: Observation,
    pub span: TimeSpan,
    sum: f64,
    count: u32,
}

/// Outcome of offering a sample to an accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accumulated,
    /// The sample's timestamp falls outside the bound interval; the caller
    /// should rebind and offer it again.
    OutOfSpan,
}

impl Accumulator {
    pub fn new(obs: Observation, span: TimeSpan) -> Self {
        Self {
            obs,
            span,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn add_sample(&mut self, rec: &LoopRecord) -> SampleOutcome {
        if !self.span.contains(rec.date_time) {
            return SampleOutcome::OutOfSpan;
        }
        if let Some(v) = self.obs.extract(rec) {
            self.sum += v;
            self.count += 1;
        }
        SampleOutcome::Accumulated
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// The paired accumulator sets plus the sticky transmitter-battery bitmap.
#[derive(Debug)]
pub struct AccumulatorSet {
    archive_interval_secs: i64,
    current: Vec<Accumulator>,
    last: Option<Vec<Accumulator>>,
    tx_battery_status: u8,
    initialized: bool,
}

impl AccumulatorSet {
    pub fn new(archive_interval_secs: u32) -> Self {
        Self {
            archive_interval_secs: archive_interval_secs.max(1) as i64,
            current: Vec::new(),
            last: None,
            tx_battery_status: 0,
            initialized: false,
        }
    }

    /// Offer a translated LOOP packet. Rebinds automatically on the first
    /// sample and on the first sample past the interval boundary.
    pub fn add_loop(&mut self, rec: &LoopRecord) {
        let out_of_span = !self.initialized
            || self
                .current
                .first()
                .is_some_and(|acc| !acc.span.contains(rec.date_time));
        if out_of_span {
            self.rebind(rec.date_time);
        }
        for acc in &mut self.current {
            let _ = acc.add_sample(rec);
        }
        self.tx_battery_status |= rec.tx_battery_status;
    }

    /// Seal `current` into `last` and start fresh accumulators for the
    /// archive-aligned interval containing `ts`. Clears the sticky battery
    /// bitmap.
    pub fn rebind(&mut self, ts: i64) {
        let start = ts.div_euclid(self.archive_interval_secs) * self.archive_interval_secs;
        let span = TimeSpan {
            start,
            stop: start + self.archive_interval_secs,
        };
        if self.initialized {
            self.last = Some(std::mem::take(&mut self.current));
        }
        self.current = Observation::DERIVED
            .iter()
            .map(|&obs| Accumulator::new(obs, span))
            .collect();
        self.tx_battery_status = 0;
        self.initialized = true;
    }

    /// Merge the sealed averages into an archive record, but only when the
    /// sealed interval ends exactly at the record's timestamp. The battery
    /// bitmap is always stamped once any LOOP data has been seen.
    pub fn merge_into(&self, rec: &mut ArchiveRecord) {
        if !self.initialized {
            return;
        }
        if let (Some(last), Some(rec_ts)) = (&self.last, rec.date_time) {
            for acc in last {
                if acc.span.stop == rec_ts {
                    if let Some(avg) = acc.avg() {
                        acc.obs.merge(avg, rec);
                    }
                }
            }
        }
        rec.tx_battery_status = Some(self.tx_battery_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vantage::loop_packet::{unpack_loop_packet, translate_loop_packet};
    use crate::vantage::US_UNITS;

    fn loop_rec(ts: i64, battery_raw: u16, tx_status: u8) -> LoopRecord {
        let mut payload = crate::vantage::loop_packet::tests::sample_payload();
        payload[86] = tx_status;
        payload[87..89].copy_from_slice(&battery_raw.to_le_bytes());
        let raw = unpack_loop_packet(&payload).unwrap();
        translate_loop_packet(&raw, US_UNITS, ts).unwrap()
    }

    fn archive_rec(ts: i64) -> ArchiveRecord {
        use crate::vantage::archive::tests::{ctx, sample_raw};
        use crate::vantage::archive::translate_archive_packet;
        let mut rec = translate_archive_packet(&sample_raw(), &ctx()).unwrap();
        rec.date_time = Some(ts);
        rec
    }

    #[test]
    fn test_span_rejection_and_average() {
        let span = TimeSpan {
            start: 600,
            stop: 900,
        };
        let mut acc = Accumulator::new(Observation::ConsBatteryVoltage, span);

        assert_eq!(acc.add_sample(&loop_rec(599, 800, 0)), SampleOutcome::OutOfSpan);
        assert_eq!(acc.add_sample(&loop_rec(900, 800, 0)), SampleOutcome::OutOfSpan);
        assert_eq!(acc.avg(), None);

        assert_eq!(acc.add_sample(&loop_rec(600, 800, 0)), SampleOutcome::Accumulated);
        assert_eq!(acc.add_sample(&loop_rec(899, 868, 0)), SampleOutcome::Accumulated);
        // (4.68 + 5.08) / 2
        assert!((acc.avg().unwrap() - 4.88).abs() < 1e-9);
    }

    #[test]
    fn test_rollover_seals_current_into_last() {
        let mut set = AccumulatorSet::new(300);
        set.add_loop(&loop_rec(610, 800, 0));
        set.add_loop(&loop_rec(890, 800, 0));
        // First sample past the boundary triggers the rollover.
        set.add_loop(&loop_rec(905, 1000, 0));

        let mut rec = archive_rec(900);
        set.merge_into(&mut rec);
        assert!((rec.cons_battery_voltage.unwrap() - 4.68).abs() < 1e-9);
    }

    #[test]
    fn test_merge_guards_against_misaligned_stop() {
        let mut set = AccumulatorSet::new(300);
        set.add_loop(&loop_rec(610, 800, 0));
        set.add_loop(&loop_rec(905, 800, 0));

        // Record from some other interval: averages must not leak in.
        let mut rec = archive_rec(1200);
        set.merge_into(&mut rec);
        assert_eq!(rec.cons_battery_voltage, None);
    }

    #[test]
    fn test_sticky_battery_or_and_reset() {
        let mut set = AccumulatorSet::new(300);
        set.add_loop(&loop_rec(610, 800, 0b0001));
        set.add_loop(&loop_rec(700, 800, 0b0100));
        set.add_loop(&loop_rec(800, 800, 0b0001));

        let mut rec = archive_rec(900);
        set.merge_into(&mut rec);
        assert_eq!(rec.tx_battery_status, Some(0b0101));

        // Rollover resets the bitmap; only the new interval's bits remain.
        set.add_loop(&loop_rec(905, 800, 0b1000));
        let mut rec = archive_rec(1200);
        set.merge_into(&mut rec);
        assert_eq!(rec.tx_battery_status, Some(0b1000));
    }

    #[test]
    fn test_merge_before_any_loop_data() {
        let set = AccumulatorSet::new(300);
        let mut rec = archive_rec(900);
        set.merge_into(&mut rec);
        assert_eq!(rec.tx_battery_status, None);
        assert_eq!(rec.cons_battery_voltage, None);
    }
}
