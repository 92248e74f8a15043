//! Batch shaping before shipment.
//!
//! A strategy decides how one drained cycle is split into wire batches. The
//! configured tag is resolved against a fixed registry at startup; an
//! unknown tag is a hard configuration error, not a runtime fallback.

use thiserror::Error;

use crate::record::SensorRecord;

/// Strategy tags accepted in configuration.
pub const ALL_STRATEGY_KINDS: &[&str] = &["direct", "size"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unknown buffer strategy '{kind}', expected one of {expected:?}")]
    UnknownKind {
        kind: String,
        expected: &'static [&'static str],
    },

    #[error("buffer strategy 'size' requires max_records >= 1")]
    InvalidMaxRecords,
}

/// Shapes a drained cycle into one or more shipment batches.
///
/// Pure: no I/O, no shared state, records are only regrouped and never
/// altered or dropped.
pub trait BufferStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn shape(&self, records: Vec<SensorRecord>) -> Vec<Vec<SensorRecord>>;
}

/// Ships the whole cycle as one batch.
pub struct DirectStrategy;

impl BufferStrategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn shape(&self, records: Vec<SensorRecord>) -> Vec<Vec<SensorRecord>> {
        if records.is_empty() {
            Vec::new()
        } else {
            vec![records]
        }
    }
}

/// Splits the cycle into batches of at most `max_records` entries.
pub struct SizeStrategy {
    max_records: usize,
}

impl SizeStrategy {
    pub fn new(max_records: usize) -> Result<Self, StrategyError> {
        if max_records == 0 {
            return Err(StrategyError::InvalidMaxRecords);
        }
        Ok(Self { max_records })
    }
}

impl BufferStrategy for SizeStrategy {
    fn name(&self) -> &'static str {
        "size"
    }

    fn shape(&self, records: Vec<SensorRecord>) -> Vec<Vec<SensorRecord>> {
        let mut batches = Vec::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            batches.push(records.by_ref().take(self.max_records).collect());
        }
        batches
    }
}

/// Resolves a configuration tag into a strategy. Fails at startup on an
/// unrecognized tag.
pub fn build(kind: &str, max_records: usize) -> Result<Box<dyn BufferStrategy>, StrategyError> {
    match kind {
        "direct" => Ok(Box::new(DirectStrategy)),
        "size" => Ok(Box::new(SizeStrategy::new(max_records)?)),
        other => Err(StrategyError::UnknownKind {
            kind: other.to_string(),
            expected: ALL_STRATEGY_KINDS,
        }),
    }
}
