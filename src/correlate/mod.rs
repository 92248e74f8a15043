//! Per-thread exception chain correlation.
//!
//! Construct/throw/catch signals from instrumented frames are stitched into
//! one event chain per throwable instance, matched by identity hash. Each
//! thread owns at most one in-flight chain; observing a new identity
//! replaces the old chain rather than appending to it.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::collector::Collector;
use crate::record::{
    ExceptionEvent, ExceptionEventKind, ExceptionRecord, GlobalId, LocalId, PlatformId,
    SensorRecord, ThrowableDetail,
};
use crate::registry::IdentifierRegistry;

/// Caller-supplied identity of the executing thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static throwable fields captured at the signal site.
#[derive(Debug, Clone)]
pub struct ThrowableStatics {
    pub throwable_type: String,
    pub error_message: String,
    pub cause_type: Option<String>,
    pub stack_trace: String,
}

impl ThrowableStatics {
    fn into_detail(self) -> ThrowableDetail {
        ThrowableDetail::new(
            self.throwable_type,
            &self.error_message,
            self.cause_type,
            self.stack_trace,
        )
    }
}

/// One construct/throw/catch observation from an instrumented frame.
#[derive(Debug, Clone)]
pub struct ThrowableSignal {
    pub thread: ThreadId,
    /// Local id of the method frame that produced the signal.
    pub method: LocalId,
    pub sensor_type: LocalId,
    pub identity_hash: u64,
    pub statics: ThrowableStatics,
}

/// The chain a thread is currently building.
struct CorrelationSlot {
    identity_hash: u64,
    root: ExceptionEvent,
    /// Frame that last caught this identity; a throw from the same frame is
    /// a rethrow, not a pass.
    handler_frame: Option<LocalId>,
}

/// Correlates exception signals into per-thread event chains and keeps the
/// current chain's record up to date in the collector.
pub struct ExceptionCorrelator {
    registry: Arc<IdentifierRegistry>,
    collector: Arc<Collector>,
    slots: DashMap<ThreadId, CorrelationSlot>,
}

impl ExceptionCorrelator {
    pub fn new(registry: Arc<IdentifierRegistry>, collector: Arc<Collector>) -> Self {
        Self {
            registry,
            collector,
            slots: DashMap::new(),
        }
    }

    /// A throwable constructor ran on `signal.thread`. Starts a fresh chain
    /// rooted at CREATED and forgets any previous handler frame.
    pub fn constructor_of_throwable(&self, signal: ThrowableSignal) {
        let Some(ids) = self.resolve(&signal) else {
            return;
        };

        let event = ExceptionEvent::new(
            ExceptionEventKind::Created,
            signal.identity_hash,
            ids.method,
            Some(signal.statics.clone().into_detail()),
        );
        let root = self.start_chain(signal.thread, signal.identity_hash, event);
        self.write_record(&signal, ids, root);
    }

    /// A throw was observed. A matching identity extends the chain with
    /// PASSED, or RETHROWN when the throwing frame previously caught this
    /// identity. A foreign identity starts an UNREGISTERED_PASSED chain.
    pub fn on_throw(&self, signal: ThrowableSignal) {
        let Some(ids) = self.resolve(&signal) else {
            return;
        };

        // The slot guard must drop before a replacement chain is inserted.
        let extended = match self.slots.get_mut(&signal.thread) {
            Some(mut slot) if slot.identity_hash == signal.identity_hash => {
                let kind = if slot.handler_frame == Some(signal.method) {
                    ExceptionEventKind::Rethrown
                } else {
                    ExceptionEventKind::Passed
                };
                slot.root.append(ExceptionEvent::new(
                    kind,
                    signal.identity_hash,
                    ids.method,
                    None,
                ));
                Some(slot.root.clone())
            }
            _ => None,
        };
        let root = match extended {
            Some(root) => root,
            None => self.start_unregistered(&signal, ids),
        };
        self.write_record(&signal, ids, root);
    }

    /// A catch block is about to run. A matching identity extends the chain
    /// with HANDLED and records the catching frame; a foreign identity
    /// starts an UNREGISTERED_PASSED chain.
    pub fn before_catch(&self, signal: ThrowableSignal) {
        let Some(ids) = self.resolve(&signal) else {
            return;
        };

        let extended = match self.slots.get_mut(&signal.thread) {
            Some(mut slot) if slot.identity_hash == signal.identity_hash => {
                slot.root.append(ExceptionEvent::new(
                    ExceptionEventKind::Handled,
                    signal.identity_hash,
                    ids.method,
                    None,
                ));
                slot.handler_frame = Some(signal.method);
                Some(slot.root.clone())
            }
            _ => None,
        };
        let root = match extended {
            Some(root) => root,
            None => self.start_unregistered(&signal, ids),
        };
        self.write_record(&signal, ids, root);
    }

    /// Resolves every id a transition needs up front. A single miss skips
    /// the whole transition: a partially identified record is useless to the
    /// collector.
    fn resolve(&self, signal: &ThrowableSignal) -> Option<ResolvedIds> {
        let platform = match self.registry.platform_id() {
            Ok(id) => id,
            Err(e) => {
                debug!(thread = %signal.thread, error = %e, "skipping exception transition");
                return None;
            }
        };
        let sensor_type = match self.registry.global_sensor_type_id(signal.sensor_type) {
            Ok(id) => id,
            Err(e) => {
                debug!(thread = %signal.thread, error = %e, "skipping exception transition");
                return None;
            }
        };
        let method = match self.registry.global_method_id(signal.method) {
            Ok(id) => id,
            Err(e) => {
                debug!(thread = %signal.thread, error = %e, "skipping exception transition");
                return None;
            }
        };
        Some(ResolvedIds {
            platform,
            sensor_type,
            method,
        })
    }

    fn start_chain(&self, thread: ThreadId, identity_hash: u64, root: ExceptionEvent) -> ExceptionEvent {
        let cloned = root.clone();
        self.slots.insert(
            thread,
            CorrelationSlot {
                identity_hash,
                root,
                handler_frame: None,
            },
        );
        cloned
    }

    /// First sighting of an identity this correlator never saw constructed:
    /// the chain starts mid-flight with freshly captured statics.
    fn start_unregistered(&self, signal: &ThrowableSignal, ids: ResolvedIds) -> ExceptionEvent {
        let event = ExceptionEvent::new(
            ExceptionEventKind::UnregisteredPassed,
            signal.identity_hash,
            ids.method,
            Some(signal.statics.clone().into_detail()),
        );
        self.start_chain(signal.thread, signal.identity_hash, event)
    }

    fn write_record(&self, signal: &ThrowableSignal, ids: ResolvedIds, chain: ExceptionEvent) {
        self.collector.add(SensorRecord::Exception(ExceptionRecord {
            timestamp: Utc::now(),
            platform_id: ids.platform,
            sensor_type_id: ids.sensor_type,
            method_id: ids.method,
            identity_hash: signal.identity_hash,
            chain,
        }));
    }
}

#[derive(Clone, Copy)]
struct ResolvedIds {
    platform: PlatformId,
    sensor_type: GlobalId,
    method: GlobalId,
}
