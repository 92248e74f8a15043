//! Measurement record data model.
//!
//! Everything the agent ships to the collector is a [`SensorRecord`], keyed by
//! a [`RecordKey`]. Within one collection cycle at most one record exists per
//! key; a later write to the same key overwrites the earlier one. Aggregation
//! across cycles happens downstream, never in the agent.

pub mod lazy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the agent itself, valid only inside this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

/// Identifier assigned by the remote collector, valid across the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalId(pub u64);

/// The collector-assigned identifier for this agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformId(pub u64);

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for PlatformId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Maximum number of characters kept from a throwable's error message.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Identity key of a live record within one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// One record per instrumented method per logical call-chain instance.
    /// The prefix disambiguates multiple instances of the same chain.
    Method {
        sensor_type: GlobalId,
        method: GlobalId,
        prefix: String,
    },
    /// One record per platform sensor type per agent process.
    Platform { sensor_type: GlobalId },
    /// One record per observed throwable instance per sensor type.
    Exception {
        sensor_type: GlobalId,
        identity_hash: u64,
    },
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Method {
                sensor_type,
                method,
                prefix,
            } => {
                if prefix.is_empty() {
                    write!(f, "{sensor_type}.{method}")
                } else {
                    write!(f, "{sensor_type}.{method}.{prefix}")
                }
            }
            Self::Platform { sensor_type } => write!(f, "{sensor_type}"),
            Self::Exception {
                sensor_type,
                identity_hash,
            } => write!(f, "{sensor_type}.{identity_hash:x}"),
        }
    }
}

/// A single measurement or event produced by an instrumented call-site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SensorRecord {
    Method(MethodRecord),
    Platform(PlatformRecord),
    Exception(ExceptionRecord),
}

impl SensorRecord {
    /// Returns the cycle key this record lives under.
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Method(r) => RecordKey::Method {
                sensor_type: r.sensor_type_id,
                method: r.method_id,
                prefix: r.prefix.clone(),
            },
            Self::Platform(r) => RecordKey::Platform {
                sensor_type: r.sensor_type_id,
            },
            Self::Exception(r) => RecordKey::Exception {
                sensor_type: r.sensor_type_id,
                identity_hash: r.identity_hash,
            },
        }
    }
}

/// Timing measurement for one instrumented method within one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodRecord {
    pub timestamp: DateTime<Utc>,
    pub platform_id: PlatformId,
    pub sensor_type_id: GlobalId,
    pub method_id: GlobalId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    pub count: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// Named gauge values produced by a platform data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRecord {
    pub timestamp: DateTime<Utc>,
    pub platform_id: PlatformId,
    pub sensor_type_id: GlobalId,
    pub gauges: Vec<Gauge>,
}

/// One named numeric value inside a [`PlatformRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
}

/// A correlated exception chain attached to one throwable instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub timestamp: DateTime<Utc>,
    pub platform_id: PlatformId,
    pub sensor_type_id: GlobalId,
    /// Method that produced the most recent event in the chain.
    pub method_id: GlobalId,
    pub identity_hash: u64,
    /// Root of the event chain; children mirror the exception's journey
    /// across frames.
    pub chain: ExceptionEvent,
}

/// Exception life-cycle stages recognized by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionEventKind {
    Created,
    Passed,
    Rethrown,
    Handled,
    /// First sighting of a throwable whose construction was not observed on
    /// this thread (e.g. built inside uninstrumented library code).
    UnregisteredPassed,
}

/// Static fields captured when a throwable is first seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowableDetail {
    pub throwable_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_type: Option<String>,
    pub stack_trace: String,
}

impl ThrowableDetail {
    /// Builds the detail block, truncating the message to
    /// [`MAX_ERROR_MESSAGE_CHARS`] characters.
    pub fn new(
        throwable_type: impl Into<String>,
        error_message: &str,
        cause_type: Option<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            throwable_type: throwable_type.into(),
            error_message: truncate_message(error_message),
            cause_type,
            stack_trace: stack_trace.into(),
        }
    }
}

/// One event in an exception chain, linked parent-to-child.
///
/// Only CREATED and UNREGISTERED_PASSED events carry the static detail
/// fields; the remaining kinds reference the same throwable by identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionEvent {
    pub kind: ExceptionEventKind,
    pub identity_hash: u64,
    /// Global id of the method frame that observed this event.
    pub frame_id: GlobalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ThrowableDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Box<ExceptionEvent>>,
}

impl ExceptionEvent {
    pub fn new(
        kind: ExceptionEventKind,
        identity_hash: u64,
        frame_id: GlobalId,
        detail: Option<ThrowableDetail>,
    ) -> Self {
        Self {
            kind,
            identity_hash,
            frame_id,
            detail,
            child: None,
        }
    }

    /// Appends `event` as the child of the current chain head.
    pub fn append(&mut self, event: ExceptionEvent) {
        match self.child {
            Some(ref mut child) => child.append(event),
            None => self.child = Some(Box::new(event)),
        }
    }

    /// Returns the most recent event in the chain.
    pub fn head(&self) -> &ExceptionEvent {
        let mut node = self;
        while let Some(child) = node.child.as_deref() {
            node = child;
        }
        node
    }

    /// Number of linked events including this one.
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut node = self;
        while let Some(child) = node.child.as_deref() {
            node = child;
            len += 1;
        }
        len
    }

    /// Iterates the chain root-first as a vector of kinds.
    pub fn kinds(&self) -> Vec<ExceptionEventKind> {
        let mut out = Vec::with_capacity(self.chain_len());
        let mut node = Some(self);
        while let Some(n) = node {
            out.push(n.kind);
            node = n.child.as_deref();
        }
        out
    }
}

/// Keeps at most [`MAX_ERROR_MESSAGE_CHARS`] characters of a message.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(identity: u64) -> ExceptionEvent {
        ExceptionEvent::new(
            ExceptionEventKind::Created,
            identity,
            GlobalId(7),
            Some(ThrowableDetail::new(
                "io.Error",
                "boom",
                None,
                "at read\nat open",
            )),
        )
    }

    #[test]
    fn test_truncate_message_exactly_limit() {
        let msg = "x".repeat(1001);
        let truncated = truncate_message(&msg);
        assert_eq!(truncated.len(), 1000);
        assert!(truncated.chars().all(|c| c == 'x'));
    }

    #[test]
    fn test_truncate_message_short_untouched() {
        assert_eq!(truncate_message("hello"), "hello");
        assert_eq!(truncate_message(""), "");
    }

    #[test]
    fn test_truncate_message_multibyte_boundary() {
        let msg = "é".repeat(1005);
        let truncated = truncate_message(&msg);
        assert_eq!(truncated.chars().count(), 1000);
    }

    #[test]
    fn test_chain_append_and_head() {
        let mut chain = created(42);
        chain.append(ExceptionEvent::new(
            ExceptionEventKind::Passed,
            42,
            GlobalId(8),
            None,
        ));
        chain.append(ExceptionEvent::new(
            ExceptionEventKind::Handled,
            42,
            GlobalId(9),
            None,
        ));

        assert_eq!(chain.chain_len(), 3);
        assert_eq!(chain.head().kind, ExceptionEventKind::Handled);
        assert_eq!(
            chain.kinds(),
            vec![
                ExceptionEventKind::Created,
                ExceptionEventKind::Passed,
                ExceptionEventKind::Handled,
            ]
        );
    }

    #[test]
    fn test_record_key_display() {
        let key = RecordKey::Method {
            sensor_type: GlobalId(10),
            method: GlobalId(5),
            prefix: String::new(),
        };
        assert_eq!(key.to_string(), "10.5");

        let key = RecordKey::Method {
            sensor_type: GlobalId(10),
            method: GlobalId(5),
            prefix: "a".to_string(),
        };
        assert_eq!(key.to_string(), "10.5.a");
    }

    #[test]
    fn test_method_record_key_roundtrip() {
        let record = SensorRecord::Method(MethodRecord {
            timestamp: Utc::now(),
            platform_id: PlatformId(1),
            sensor_type_id: GlobalId(10),
            method_id: GlobalId(5),
            prefix: String::new(),
            count: 1,
            sum_ms: 1.5,
            min_ms: 1.5,
            max_ms: 1.5,
        });
        assert_eq!(
            record.key(),
            RecordKey::Method {
                sensor_type: GlobalId(10),
                method: GlobalId(5),
                prefix: String::new(),
            }
        );
    }

    #[test]
    fn test_exception_record_serializes_without_empty_fields() {
        let record = SensorRecord::Exception(ExceptionRecord {
            timestamp: Utc::now(),
            platform_id: PlatformId(1),
            sensor_type_id: GlobalId(3),
            method_id: GlobalId(7),
            identity_hash: 42,
            chain: created(42),
        });

        let json = serde_json::to_string(&record).expect("serializes");
        assert!(json.contains("\"record\":\"exception\""));
        assert!(!json.contains("\"child\""));
        assert!(!json.contains("\"cause_type\""));
    }
}
