//! Call-site facade for instrumented code.
//!
//! Every method here is total: whatever goes wrong inside the agent, the
//! instrumented application only ever sees a no-op and a log line. Timing
//! hooks keep a per-thread stack of open frames so nested instrumented
//! calls attribute their durations to the right method.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::collector::Collector;
use crate::connection::{MethodDescriptor, SensorTypeDescriptor};
use crate::correlate::{ExceptionCorrelator, ThreadId, ThrowableSignal};
use crate::record::LocalId;
use crate::registry::IdentifierRegistry;

/// One entered-but-not-exited instrumented frame.
struct OpenFrame {
    method: LocalId,
    sensor_type: LocalId,
    started: Instant,
    body_ended: Option<Instant>,
}

/// Cheap handle instrumented code calls into. Clones share state.
#[derive(Clone)]
pub struct Hooks {
    registry: Arc<IdentifierRegistry>,
    collector: Arc<Collector>,
    correlator: Arc<ExceptionCorrelator>,
    flush_signal: Arc<Notify>,
    frames: Arc<DashMap<ThreadId, Vec<OpenFrame>>>,
}

impl Hooks {
    pub(crate) fn new(
        registry: Arc<IdentifierRegistry>,
        collector: Arc<Collector>,
        correlator: Arc<ExceptionCorrelator>,
        flush_signal: Arc<Notify>,
    ) -> Self {
        Self {
            registry,
            collector,
            correlator,
            flush_signal,
            frames: Arc::new(DashMap::new()),
        }
    }

    /// Returns a usable local id immediately; registration happens in the
    /// background.
    pub fn register_method(&self, descriptor: &MethodDescriptor) -> LocalId {
        self.guard("register_method", LocalId(0), || {
            self.registry.local_method_id(descriptor)
        })
    }

    pub fn register_sensor_type(&self, descriptor: &SensorTypeDescriptor) -> LocalId {
        self.guard("register_sensor_type", LocalId(0), || {
            self.registry.local_sensor_type_id(descriptor)
        })
    }

    pub fn assign_sensor_type(&self, sensor_type: LocalId, method: LocalId) {
        self.guard("assign_sensor_type", (), || {
            self.registry.register_association(sensor_type, method);
        });
    }

    /// Method entry: opens a timing frame on the calling thread's stack.
    pub fn before_body(&self, thread: ThreadId, method: LocalId, sensor_type: LocalId) {
        self.guard("before_body", (), || {
            self.frames.entry(thread).or_default().push(OpenFrame {
                method,
                sensor_type,
                started: Instant::now(),
                body_ended: None,
            });
        });
    }

    /// Runs right after a normal body exit; marks where the body ended so a
    /// slow exit path does not inflate the measured duration.
    pub fn first_after_body(&self, thread: ThreadId, method: LocalId) {
        self.guard("first_after_body", (), || {
            let Some(mut stack) = self.frames.get_mut(&thread) else {
                return;
            };
            if let Some(frame) = stack.iter_mut().rev().find(|f| f.method == method) {
                frame.body_ended = Some(Instant::now());
            }
        });
    }

    /// Runs on every exit path (normal or exceptional): closes the frame
    /// and folds the duration into the current cycle.
    pub fn second_after_body(&self, thread: ThreadId, method: LocalId) {
        self.guard("second_after_body", (), || {
            let frame = {
                let Some(mut stack) = self.frames.get_mut(&thread) else {
                    debug!(thread = %thread, "frame exit without entry");
                    return;
                };
                let Some(pos) = stack.iter().rposition(|f| f.method == method) else {
                    debug!(thread = %thread, method = %method, "frame exit without entry");
                    return;
                };
                stack.remove(pos)
            };

            let ended = frame.body_ended.unwrap_or_else(Instant::now);
            let duration = ended.duration_since(frame.started);

            // All three ids must resolve, or the sample is dropped for this
            // cycle.
            let Ok(platform_id) = self.registry.platform_id() else {
                return;
            };
            let Ok(sensor_type_id) = self.registry.global_sensor_type_id(frame.sensor_type)
            else {
                return;
            };
            let Ok(method_id) = self.registry.global_method_id(frame.method) else {
                return;
            };

            self.collector.record_timing(
                platform_id,
                sensor_type_id,
                method_id,
                String::new(),
                duration,
            );
        });
    }

    pub fn constructor_of_throwable(&self, signal: ThrowableSignal) {
        self.guard("constructor_of_throwable", (), || {
            self.correlator.constructor_of_throwable(signal);
        });
    }

    pub fn on_throw(&self, signal: ThrowableSignal) {
        self.guard("on_throw", (), || {
            self.correlator.on_throw(signal);
        });
    }

    pub fn before_catch(&self, signal: ThrowableSignal) {
        self.guard("before_catch", (), || {
            self.correlator.before_catch(signal);
        });
    }

    /// Asks the delivery worker for an out-of-band flush cycle.
    pub fn flush_now(&self) {
        self.flush_signal.notify_one();
    }

    /// Nothing behind this facade may unwind into instrumented code.
    fn guard<T>(&self, op: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(_) => {
                error!(op, "agent hook failed, continuing without it");
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::record::{GlobalId, PlatformId, SensorRecord};

    use super::*;

    struct Fixture {
        registry: Arc<IdentifierRegistry>,
        collector: Arc<Collector>,
        hooks: Hooks,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(IdentifierRegistry::new());
        let collector = Arc::new(Collector::new());
        let correlator = Arc::new(ExceptionCorrelator::new(
            Arc::clone(&registry),
            Arc::clone(&collector),
        ));
        let hooks = Hooks::new(
            Arc::clone(&registry),
            Arc::clone(&collector),
            correlator,
            Arc::new(Notify::new()),
        );
        Fixture {
            registry,
            collector,
            hooks,
        }
    }

    fn registered_ids(f: &Fixture) -> (LocalId, LocalId) {
        let method = f
            .hooks
            .register_method(&MethodDescriptor::new("acme.Service", "handle"));
        let sensor_type = f
            .hooks
            .register_sensor_type(&SensorTypeDescriptor::new("timer"));
        f.registry.store_platform(PlatformId(1));
        f.registry.map_method(method, GlobalId(11));
        f.registry.map_sensor_type(sensor_type, GlobalId(21));
        (method, sensor_type)
    }

    #[test]
    fn test_timing_frame_reaches_collector() {
        let f = fixture();
        let (method, sensor_type) = registered_ids(&f);
        let thread = ThreadId(1);

        f.hooks.before_body(thread, method, sensor_type);
        f.hooks.first_after_body(thread, method);
        f.hooks.second_after_body(thread, method);

        let drained = f.collector.swap_cycle();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            SensorRecord::Method(m) => {
                assert_eq!(m.count, 1);
                assert_eq!(m.method_id, GlobalId(11));
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_nested_frames_attribute_separately() {
        let f = fixture();
        let (outer, sensor_type) = registered_ids(&f);
        let inner = f
            .hooks
            .register_method(&MethodDescriptor::new("acme.Repo", "query"));
        f.registry.map_method(inner, GlobalId(12));
        let thread = ThreadId(1);

        f.hooks.before_body(thread, outer, sensor_type);
        f.hooks.before_body(thread, inner, sensor_type);
        f.hooks.second_after_body(thread, inner);
        f.hooks.second_after_body(thread, outer);

        assert_eq!(f.collector.swap_cycle().len(), 2);
    }

    #[test]
    fn test_exit_without_entry_is_noop() {
        let f = fixture();
        let (method, _) = registered_ids(&f);
        f.hooks.second_after_body(ThreadId(1), method);
        assert!(f.collector.swap_cycle().is_empty());
    }

    #[test]
    fn test_unresolved_ids_drop_sample() {
        let f = fixture();
        let method = f
            .hooks
            .register_method(&MethodDescriptor::new("acme.Service", "handle"));
        let sensor_type = f
            .hooks
            .register_sensor_type(&SensorTypeDescriptor::new("timer"));
        // No platform, no global mappings.
        let thread = ThreadId(1);

        f.hooks.before_body(thread, method, sensor_type);
        f.hooks.second_after_body(thread, method);
        assert!(f.collector.swap_cycle().is_empty());
    }

    #[test]
    fn test_guard_swallows_panics() {
        let f = fixture();
        let out = f.hooks.guard("test_op", 7, || -> i32 { panic!("boom") });
        assert_eq!(out, 7);
    }
}
