//! Local-to-global identifier reconciliation.
//!
//! Call-sites receive a local identifier immediately, with no network wait;
//! the [`RegistrationWorker`](worker::RegistrationWorker) later trades the
//! pending entries for collector-assigned global identifiers. Mappings are
//! created once and never removed for the lifetime of the process.

pub mod worker;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::connection::{MethodDescriptor, SensorTypeDescriptor};
use crate::record::{GlobalId, LocalId, PlatformId};

/// Identifier translation failures. All of them are per-call and non-fatal:
/// the caller drops the signal for this cycle instead of retrying inline.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdError {
    #[error("no global mapping yet for {kind} local id {id}")]
    Unavailable { kind: &'static str, id: u64 },

    #[error("platform not registered yet")]
    PlatformUnavailable,

    /// Registration is currently failing; immediate-mode callers fail fast
    /// until the background worker clears the flag.
    #[error("registration failing, degraded to local ids only")]
    RegistrationFailing,
}

/// A method waiting for its collector-assigned identifier.
#[derive(Debug, Clone)]
pub struct PendingMethod {
    pub local: LocalId,
    pub descriptor: MethodDescriptor,
}

/// A sensor type waiting for its collector-assigned identifier.
#[derive(Debug, Clone)]
pub struct PendingSensorType {
    pub local: LocalId,
    pub descriptor: SensorTypeDescriptor,
}

/// A sensor-type/method association waiting to be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAssociation {
    pub sensor_type: LocalId,
    pub method: LocalId,
}

/// Shared identifier state: eager local assignment, confirmed global
/// mappings, and the FIFO queues the registration worker drains.
pub struct IdentifierRegistry {
    method_locals: DashMap<MethodDescriptor, LocalId>,
    sensor_type_locals: DashMap<SensorTypeDescriptor, LocalId>,
    method_globals: DashMap<LocalId, GlobalId>,
    sensor_type_globals: DashMap<LocalId, GlobalId>,

    next_method: AtomicU64,
    next_sensor_type: AtomicU64,
    platform: AtomicU64,
    registration_failing: AtomicBool,

    method_queue: Mutex<VecDeque<PendingMethod>>,
    sensor_type_queue: Mutex<VecDeque<PendingSensorType>>,
    association_queue: Mutex<VecDeque<PendingAssociation>>,

    /// Wakes the registration worker when new pending entries arrive.
    pending: Notify,
}

impl IdentifierRegistry {
    pub fn new() -> Self {
        Self {
            method_locals: DashMap::new(),
            sensor_type_locals: DashMap::new(),
            method_globals: DashMap::new(),
            sensor_type_globals: DashMap::new(),
            next_method: AtomicU64::new(1),
            next_sensor_type: AtomicU64::new(1),
            platform: AtomicU64::new(0),
            registration_failing: AtomicBool::new(false),
            method_queue: Mutex::new(VecDeque::new()),
            sensor_type_queue: Mutex::new(VecDeque::new()),
            association_queue: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
        }
    }

    /// Returns the local id for a method descriptor, assigning and enqueueing
    /// it on first sight. Repeated calls with the same descriptor return the
    /// same id; first-time descriptors receive strictly increasing ids.
    pub fn local_method_id(&self, descriptor: &MethodDescriptor) -> LocalId {
        if let Some(existing) = self.method_locals.get(descriptor) {
            return *existing;
        }

        let local = *self
            .method_locals
            .entry(descriptor.clone())
            .or_insert_with(|| {
                let id = LocalId(self.next_method.fetch_add(1, Ordering::Relaxed));
                self.method_queue.lock().push_back(PendingMethod {
                    local: id,
                    descriptor: descriptor.clone(),
                });
                id
            });
        self.pending.notify_one();
        local
    }

    /// Same contract as [`local_method_id`](Self::local_method_id), for
    /// sensor types.
    pub fn local_sensor_type_id(&self, descriptor: &SensorTypeDescriptor) -> LocalId {
        if let Some(existing) = self.sensor_type_locals.get(descriptor) {
            return *existing;
        }

        let local = *self
            .sensor_type_locals
            .entry(descriptor.clone())
            .or_insert_with(|| {
                let id = LocalId(self.next_sensor_type.fetch_add(1, Ordering::Relaxed));
                self.sensor_type_queue.lock().push_back(PendingSensorType {
                    local: id,
                    descriptor: descriptor.clone(),
                });
                id
            });
        self.pending.notify_one();
        local
    }

    /// Queues a sensor-type/method association for registration. The worker
    /// only attempts it once both ends have confirmed global mappings.
    pub fn register_association(&self, sensor_type: LocalId, method: LocalId) {
        self.association_queue.lock().push_back(PendingAssociation {
            sensor_type,
            method,
        });
        self.pending.notify_one();
    }

    /// Translates a local method id, failing when registration has not
    /// caught up yet.
    pub fn global_method_id(&self, local: LocalId) -> Result<GlobalId, IdError> {
        self.method_globals
            .get(&local)
            .map(|g| *g)
            .ok_or(IdError::Unavailable {
                kind: "method",
                id: local.0,
            })
    }

    /// Translates a local sensor-type id.
    pub fn global_sensor_type_id(&self, local: LocalId) -> Result<GlobalId, IdError> {
        self.sensor_type_globals
            .get(&local)
            .map(|g| *g)
            .ok_or(IdError::Unavailable {
                kind: "sensor type",
                id: local.0,
            })
    }

    /// Returns the platform id, failing fast while the registration worker
    /// is in its error window or has not registered the platform yet.
    pub fn platform_id(&self) -> Result<PlatformId, IdError> {
        if self.registration_failing.load(Ordering::Relaxed) {
            return Err(IdError::RegistrationFailing);
        }
        match self.platform.load(Ordering::Relaxed) {
            0 => {
                // Nudge the worker; callers never wait here.
                self.pending.notify_one();
                Err(IdError::PlatformUnavailable)
            }
            raw => Ok(PlatformId(raw)),
        }
    }

    /// Whether the worker is currently in its failure/backoff window.
    pub fn is_registration_failing(&self) -> bool {
        self.registration_failing.load(Ordering::Relaxed)
    }

    // --- Worker-facing side ---

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.pending.notified()
    }

    pub(crate) fn set_registration_failing(&self, failing: bool) {
        self.registration_failing.store(failing, Ordering::Relaxed);
    }

    pub(crate) fn store_platform(&self, id: PlatformId) {
        self.platform.store(id.0, Ordering::Relaxed);
    }

    pub(crate) fn platform_raw(&self) -> Option<PlatformId> {
        match self.platform.load(Ordering::Relaxed) {
            0 => None,
            raw => Some(PlatformId(raw)),
        }
    }

    /// Records a confirmed method mapping. Called before the queue entry is
    /// removed so an interrupted drain can resume safely.
    pub(crate) fn map_method(&self, local: LocalId, global: GlobalId) {
        self.method_globals.entry(local).or_insert(global);
    }

    pub(crate) fn map_sensor_type(&self, local: LocalId, global: GlobalId) {
        self.sensor_type_globals.entry(local).or_insert(global);
    }

    pub(crate) fn front_method(&self) -> Option<PendingMethod> {
        self.method_queue.lock().front().cloned()
    }

    pub(crate) fn pop_method(&self) {
        self.method_queue.lock().pop_front();
    }

    pub(crate) fn front_sensor_type(&self) -> Option<PendingSensorType> {
        self.sensor_type_queue.lock().front().cloned()
    }

    pub(crate) fn pop_sensor_type(&self) {
        self.sensor_type_queue.lock().pop_front();
    }

    pub(crate) fn front_association(&self) -> Option<PendingAssociation> {
        self.association_queue.lock().front().cloned()
    }

    pub(crate) fn pop_association(&self) {
        self.association_queue.lock().pop_front();
    }

    /// Whether a method local id is still waiting in the queue.
    pub(crate) fn method_pending(&self, local: LocalId) -> bool {
        self.method_queue.lock().iter().any(|p| p.local == local)
    }

    pub(crate) fn sensor_type_pending(&self, local: LocalId) -> bool {
        self.sensor_type_queue
            .lock()
            .iter()
            .any(|p| p.local == local)
    }

    /// True when any queue still holds entries.
    pub fn has_pending(&self) -> bool {
        !self.method_queue.lock().is_empty()
            || !self.sensor_type_queue.lock().is_empty()
            || !self.association_queue.lock().is_empty()
    }

    /// Pending entry counts (methods, sensor types, associations).
    pub fn pending_counts(&self) -> (usize, usize, usize) {
        (
            self.method_queue.lock().len(),
            self.sensor_type_queue.lock().len(),
            self.association_queue.lock().len(),
        )
    }
}

impl Default for IdentifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> MethodDescriptor {
        MethodDescriptor::new("acme.Service", name)
    }

    #[test]
    fn test_local_method_id_idempotent() {
        let registry = IdentifierRegistry::new();
        let a = registry.local_method_id(&descriptor("handle"));
        let b = registry.local_method_id(&descriptor("handle"));
        assert_eq!(a, b);
        let (methods, _, _) = registry.pending_counts();
        assert_eq!(methods, 1);
    }

    #[test]
    fn test_local_method_ids_strictly_increasing() {
        let registry = IdentifierRegistry::new();
        let a = registry.local_method_id(&descriptor("a"));
        let b = registry.local_method_id(&descriptor("b"));
        let c = registry.local_method_id(&descriptor("c"));
        assert!(a < b && b < c);
    }

    #[test]
    fn test_concurrent_assignment_yields_unique_ids() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(IdentifierRegistry::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let mut ids = Vec::new();
                for i in 0..100 {
                    ids.push(registry.local_method_id(&descriptor(&format!("m{t}_{i}"))));
                }
                ids
            }));
        }

        let mut all: Vec<LocalId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
    }

    #[test]
    fn test_translate_unmapped_fails_nonfatal() {
        let registry = IdentifierRegistry::new();
        let local = registry.local_method_id(&descriptor("handle"));
        assert_eq!(
            registry.global_method_id(local),
            Err(IdError::Unavailable {
                kind: "method",
                id: local.0,
            })
        );
    }

    #[test]
    fn test_mapping_is_write_once() {
        let registry = IdentifierRegistry::new();
        let local = registry.local_method_id(&descriptor("handle"));
        registry.map_method(local, GlobalId(100));
        registry.map_method(local, GlobalId(200));
        assert_eq!(registry.global_method_id(local), Ok(GlobalId(100)));
    }

    #[test]
    fn test_platform_id_fails_fast_during_error_window() {
        let registry = IdentifierRegistry::new();
        registry.store_platform(PlatformId(9));
        assert_eq!(registry.platform_id(), Ok(PlatformId(9)));

        registry.set_registration_failing(true);
        assert_eq!(registry.platform_id(), Err(IdError::RegistrationFailing));

        registry.set_registration_failing(false);
        assert_eq!(registry.platform_id(), Ok(PlatformId(9)));
    }

    #[test]
    fn test_queue_order_is_fifo() {
        let registry = IdentifierRegistry::new();
        registry.local_method_id(&descriptor("first"));
        registry.local_method_id(&descriptor("second"));

        let front = registry.front_method().expect("entry");
        assert_eq!(front.descriptor.method_name, "first");
        registry.pop_method();
        let front = registry.front_method().expect("entry");
        assert_eq!(front.descriptor.method_name, "second");
    }
}
