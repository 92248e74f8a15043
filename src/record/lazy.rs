//! Records whose final value is only known at flush time.
//!
//! A lazy storage absorbs samples cheaply during the cycle and pays the
//! finalization cost once, at the swap boundary. Storages that are
//! overwritten before the boundary never get finalized at all.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{GlobalId, MethodRecord, PlatformId, SensorRecord};

/// A record finalized on demand at the cycle boundary.
pub trait LazyRecord: Send + Sync {
    /// Materializes the storage into the record that ships.
    fn finalize(self: Box<Self>) -> SensorRecord;
}

/// Aggregates method timings for one key over one collection cycle.
#[derive(Debug)]
pub struct TimerStorage {
    timestamp: DateTime<Utc>,
    platform_id: PlatformId,
    sensor_type_id: GlobalId,
    method_id: GlobalId,
    prefix: String,
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl TimerStorage {
    pub fn new(
        platform_id: PlatformId,
        sensor_type_id: GlobalId,
        method_id: GlobalId,
        prefix: String,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            platform_id,
            sensor_type_id,
            method_id,
            prefix,
            count: 0,
            sum_ms: 0.0,
            min_ms: f64::MAX,
            max_ms: f64::MIN,
        }
    }

    /// Absorbs one method invocation duration.
    pub fn record(&mut self, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        self.count += 1;
        self.sum_ms += ms;
        if ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl LazyRecord for TimerStorage {
    fn finalize(self: Box<Self>) -> SensorRecord {
        let (min_ms, max_ms) = if self.count == 0 {
            (0.0, 0.0)
        } else {
            (self.min_ms, self.max_ms)
        };

        SensorRecord::Method(MethodRecord {
            timestamp: self.timestamp,
            platform_id: self.platform_id,
            sensor_type_id: self.sensor_type_id,
            method_id: self.method_id,
            prefix: self.prefix,
            count: self.count,
            sum_ms: self.sum_ms,
            min_ms,
            max_ms,
        })
    }
}
