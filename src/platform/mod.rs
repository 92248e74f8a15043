//! Platform gauges sampled from procfs.
//!
//! Providers recompute their gauges on every refresh tick; the resulting
//! record replaces the previous one for the same key, so a cycle carries at
//! most one snapshot per provider.

use std::fs;

use crate::record::{Gauge, LocalId};

/// Produces one platform record's worth of gauges per refresh.
pub trait PlatformProvider: Send + Sync {
    /// Provider name, used in logs.
    fn name(&self) -> &'static str;

    /// Local sensor-type id registered for this provider.
    fn sensor_type(&self) -> LocalId;

    /// Samples the current gauge values. An empty vec means this refresh
    /// produced nothing to report.
    fn collect(&self) -> Vec<Gauge>;
}

/// Process memory usage from `/proc/self/status`.
pub struct MemoryProvider {
    sensor_type: LocalId,
}

impl MemoryProvider {
    pub fn new(sensor_type: LocalId) -> Self {
        Self { sensor_type }
    }
}

impl PlatformProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn sensor_type(&self) -> LocalId {
        self.sensor_type
    }

    fn collect(&self) -> Vec<Gauge> {
        let status = fs::read_to_string("/proc/self/status").unwrap_or_default();
        parse_memory_gauges(&status)
    }
}

/// Cumulative process CPU time from `/proc/self/stat`.
pub struct CpuProvider {
    sensor_type: LocalId,
    tick_hz: f64,
}

impl CpuProvider {
    pub fn new(sensor_type: LocalId) -> Self {
        // USER_HZ is 100 on every mainstream Linux configuration.
        Self {
            sensor_type,
            tick_hz: 100.0,
        }
    }
}

impl PlatformProvider for CpuProvider {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn sensor_type(&self) -> LocalId {
        self.sensor_type
    }

    fn collect(&self) -> Vec<Gauge> {
        let stat = fs::read_to_string("/proc/self/stat").unwrap_or_default();
        parse_cpu_gauges(&stat, self.tick_hz)
    }
}

/// Extracts VmRSS and VmSize from `/proc/self/status` content, in bytes.
fn parse_memory_gauges(status: &str) -> Vec<Gauge> {
    let mut gauges = Vec::with_capacity(2);
    if let Some(bytes) = parse_status_kb(status, "VmRSS:") {
        gauges.push(Gauge {
            name: "resident_bytes".to_string(),
            value: bytes as f64,
        });
    }
    if let Some(bytes) = parse_status_kb(status, "VmSize:") {
        gauges.push(Gauge {
            name: "virtual_bytes".to_string(),
            value: bytes as f64,
        });
    }
    gauges
}

fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(field) {
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            return Some(kb.saturating_mul(1024));
        }
    }
    None
}

/// Extracts utime and stime from `/proc/self/stat` content as seconds.
///
/// The comm field (2) may contain spaces, so fields are counted from the
/// closing parenthesis rather than the start of the line.
fn parse_cpu_gauges(stat: &str, tick_hz: f64) -> Vec<Gauge> {
    let Some((utime_ticks, stime_ticks)) = parse_stat_cpu_ticks(stat) else {
        return Vec::new();
    };
    vec![
        Gauge {
            name: "user_seconds".to_string(),
            value: utime_ticks as f64 / tick_hz,
        },
        Gauge {
            name: "system_seconds".to_string(),
            value: stime_ticks as f64 / tick_hz,
        },
    ]
}

fn parse_stat_cpu_ticks(stat: &str) -> Option<(u64, u64)> {
    let rest = stat.rsplit_once(')')?.1;
    // After the comm field: state is field 3, utime field 14, stime field 15.
    let mut fields = rest.split_whitespace();
    let utime = fields.nth(11)?.parse::<u64>().ok()?;
    let stime = fields.next()?.parse::<u64>().ok()?;
    Some((utime, stime))
}
