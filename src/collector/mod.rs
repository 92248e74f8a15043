//! Double-buffered record collection.
//!
//! Producers write into the active cycle without blocking each other; the
//! delivery worker swaps in a fresh cycle and drains the previous one. A
//! record lands in exactly one cycle: the swap waits for in-flight writers
//! to release the old pair before draining it.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::record::lazy::{LazyRecord, TimerStorage};
use crate::record::{GlobalId, PlatformId, RecordKey, SensorRecord};

/// One collection cycle: finished records plus still-aggregating timers.
#[derive(Default)]
struct CyclePair {
    records: DashMap<RecordKey, SensorRecord>,
    timers: DashMap<RecordKey, TimerStorage>,
}

/// Shared record buffer with atomic cycle swap.
pub struct Collector {
    cycle: ArcSwap<CyclePair>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            cycle: ArcSwap::from_pointee(CyclePair::default()),
        }
    }

    /// Stores a finished record, replacing any earlier record with the same
    /// key in this cycle. Last write wins.
    pub fn add(&self, record: SensorRecord) {
        let pair = self.cycle.load_full();
        pair.records.insert(record.key(), record);
    }

    /// Folds one timed invocation into the cycle's aggregate for the method.
    pub fn record_timing(
        &self,
        platform_id: PlatformId,
        sensor_type_id: GlobalId,
        method_id: GlobalId,
        prefix: String,
        duration: Duration,
    ) {
        let key = RecordKey::Method {
            sensor_type: sensor_type_id,
            method: method_id,
            prefix: prefix.clone(),
        };
        let pair = self.cycle.load_full();
        pair.timers
            .entry(key)
            .or_insert_with(|| TimerStorage::new(platform_id, sensor_type_id, method_id, prefix))
            .record(duration);
    }

    /// Swaps in a fresh cycle and returns everything collected in the old
    /// one, with timer aggregates finalized into records.
    ///
    /// Producers holding the old pair finish their writes before the drain
    /// starts, so nothing straddles two cycles.
    pub fn swap_cycle(&self) -> Vec<SensorRecord> {
        let mut old = self.cycle.swap(Arc::new(CyclePair::default()));
        let pair = loop {
            match Arc::try_unwrap(old) {
                Ok(pair) => break pair,
                Err(shared) => {
                    old = shared;
                    std::thread::yield_now();
                }
            }
        };

        let mut drained: Vec<SensorRecord> =
            pair.records.into_iter().map(|(_, record)| record).collect();
        for (_, timer) in pair.timers {
            let boxed: Box<dyn LazyRecord> = Box::new(timer);
            drained.push(boxed.finalize());
        }
        drained
    }

    /// Number of entries waiting in the active cycle.
    pub fn len(&self) -> usize {
        let pair = self.cycle.load();
        pair.records.len() + pair.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::record::PlatformRecord;

    use super::*;

    fn platform_record(sensor_type: u64, value: f64) -> SensorRecord {
        SensorRecord::Platform(PlatformRecord {
            timestamp: Utc::now(),
            platform_id: PlatformId(1),
            sensor_type_id: GlobalId(sensor_type),
            gauges: vec![crate::record::Gauge {
                name: "used".to_string(),
                value,
            }],
        })
    }

    #[test]
    fn test_add_overwrites_same_key() {
        let collector = Collector::new();
        collector.add(platform_record(5, 1.0));
        collector.add(platform_record(5, 2.0));

        let drained = collector.swap_cycle();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            SensorRecord::Platform(p) => assert_eq!(p.gauges[0].value, 2.0),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_distinct_keys_kept_separately() {
        let collector = Collector::new();
        collector.add(platform_record(5, 1.0));
        collector.add(platform_record(6, 2.0));
        assert_eq!(collector.swap_cycle().len(), 2);
    }

    #[test]
    fn test_swap_leaves_empty_cycle() {
        let collector = Collector::new();
        collector.add(platform_record(5, 1.0));
        collector.swap_cycle();
        assert!(collector.is_empty());
        assert!(collector.swap_cycle().is_empty());
    }

    #[test]
    fn test_timings_aggregate_within_cycle() {
        let collector = Collector::new();
        for ms in [10, 20, 30] {
            collector.record_timing(
                PlatformId(1),
                GlobalId(5),
                GlobalId(7),
                String::new(),
                Duration::from_millis(ms),
            );
        }

        let drained = collector.swap_cycle();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            SensorRecord::Method(m) => {
                assert_eq!(m.count, 3);
                assert!((m.sum_ms - 60.0).abs() < 1e-6);
                assert!((m.min_ms - 10.0).abs() < 1e-6);
                assert!((m.max_ms - 30.0).abs() < 1e-6);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_writers_never_lose_records() {
        use std::thread;

        let collector = Arc::new(Collector::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for i in 0..250u64 {
                        collector.add(platform_record(t * 1000 + i, i as f64));
                    }
                })
            })
            .collect();

        let swapper = {
            let collector = Arc::clone(&collector);
            thread::spawn(move || {
                let mut total = 0usize;
                for _ in 0..20 {
                    total += collector.swap_cycle().len();
                    thread::yield_now();
                }
                total
            })
        };

        for w in writers {
            w.join().expect("writer panicked");
        }
        let mid_swaps = swapper.join().expect("swapper panicked");
        let final_drain = collector.swap_cycle().len();

        // Every key is unique, so across all swaps exactly 1000 come out.
        assert_eq!(mid_swaps + final_drain, 1000);
    }
}
