//! Background drain of the pending registration queues.
//!
//! Platform registration is the prerequisite for everything else; after it
//! the worker drains methods, sensor types, and associations strictly FIFO,
//! one entry at a time. The global id is stored in the registry *before* the
//! entry leaves its queue, so an interrupted drain resumes without loss.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionError};
use crate::record::PlatformId;

use super::{IdentifierRegistry, PendingAssociation};

/// Drains pending registrations against the collector with fixed backoff.
pub struct RegistrationWorker<C> {
    registry: Arc<IdentifierRegistry>,
    connection: Arc<C>,
    agent_name: String,
    backoff: Duration,
}

impl<C: Connection> RegistrationWorker<C> {
    pub fn new(
        registry: Arc<IdentifierRegistry>,
        connection: Arc<C>,
        agent_name: String,
        backoff: Duration,
    ) -> Self {
        Self {
            registry,
            connection,
            agent_name,
            backoff,
        }
    }

    /// Spawns the worker loop on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(backoff = ?self.backoff, "registration worker started");

        loop {
            match self.drain().await {
                Ok(()) => {
                    self.registry.set_registration_failing(false);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.registry.notified() => {}
                    }
                }
                Err(e) => {
                    self.registry.set_registration_failing(true);
                    warn!(error = %e, backoff = ?self.backoff, "registration failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        info!("registration worker stopped");
    }

    /// Registers the platform (if needed), then empties each queue in order.
    async fn drain(&self) -> Result<(), ConnectionError> {
        let platform = self.ensure_platform().await?;

        while let Some(pending) = self.registry.front_method() {
            let global = self
                .connection
                .register_method(platform, &pending.descriptor)
                .await?;
            self.registry.map_method(pending.local, global);
            self.registry.pop_method();
            debug!(
                method = %pending.descriptor.qualified_name(),
                local = %pending.local,
                global = %global,
                "method registered"
            );
        }

        while let Some(pending) = self.registry.front_sensor_type() {
            let global = self
                .connection
                .register_sensor_type(platform, &pending.descriptor)
                .await?;
            self.registry.map_sensor_type(pending.local, global);
            self.registry.pop_sensor_type();
            debug!(
                sensor_type = %pending.descriptor.name,
                local = %pending.local,
                global = %global,
                "sensor type registered"
            );
        }

        while let Some(pending) = self.registry.front_association() {
            if !self.try_association(pending).await? {
                // Ends are still pending in another queue; a later wake-up
                // retries once they are mapped.
                break;
            }
        }

        Ok(())
    }

    /// Attempts one association. Returns `false` when either end is still
    /// waiting for its own registration.
    async fn try_association(&self, pending: PendingAssociation) -> Result<bool, ConnectionError> {
        let sensor_type = match self.registry.global_sensor_type_id(pending.sensor_type) {
            Ok(id) => id,
            Err(_) if self.registry.sensor_type_pending(pending.sensor_type) => return Ok(false),
            Err(_) => {
                // Never enqueued at all: a protocol error, not a retry case.
                error!(
                    sensor_type = %pending.sensor_type,
                    method = %pending.method,
                    "association references an unregistered sensor type, dropping"
                );
                self.registry.pop_association();
                return Ok(true);
            }
        };

        let method = match self.registry.global_method_id(pending.method) {
            Ok(id) => id,
            Err(_) if self.registry.method_pending(pending.method) => return Ok(false),
            Err(_) => {
                error!(
                    sensor_type = %pending.sensor_type,
                    method = %pending.method,
                    "association references an unregistered method, dropping"
                );
                self.registry.pop_association();
                return Ok(true);
            }
        };

        self.connection
            .add_sensor_type_to_method(sensor_type, method)
            .await?;
        self.registry.pop_association();
        debug!(sensor_type = %sensor_type, method = %method, "association registered");
        Ok(true)
    }

    async fn ensure_platform(&self) -> Result<PlatformId, ConnectionError> {
        if let Some(platform) = self.registry.platform_raw() {
            return Ok(platform);
        }

        let platform = self.connection.register_platform(&self.agent_name).await?;
        self.registry.store_platform(platform);
        info!(platform = %platform, agent = %self.agent_name, "platform registered");
        Ok(platform)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::connection::{MethodDescriptor, SensorTypeDescriptor};
    use crate::record::{GlobalId, LocalId, SensorRecord};
    use crate::registry::IdError;

    use super::*;

    /// Scripted collector double recording call order.
    #[derive(Default)]
    struct ScriptedConnection {
        fail_everything: AtomicBool,
        calls: Mutex<Vec<String>>,
        next_id: std::sync::atomic::AtomicU64,
    }

    impl ScriptedConnection {
        fn new() -> Self {
            Self {
                next_id: std::sync::atomic::AtomicU64::new(100),
                ..Default::default()
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("lock").push(call);
        }

        fn check_up(&self) -> Result<(), ConnectionError> {
            if self.fail_everything.load(Ordering::Relaxed) {
                Err(ConnectionError::unavailable("scripted outage"))
            } else {
                Ok(())
            }
        }

        fn issue_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }
    }

    impl Connection for ScriptedConnection {
        async fn connect(&self, _host: &str, _port: u16) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.fail_everything.load(Ordering::Relaxed)
        }

        async fn register_platform(&self, name: &str) -> Result<PlatformId, ConnectionError> {
            self.check_up()?;
            self.record(format!("platform:{name}"));
            Ok(PlatformId(self.issue_id()))
        }

        async fn register_method(
            &self,
            _platform: PlatformId,
            descriptor: &MethodDescriptor,
        ) -> Result<GlobalId, ConnectionError> {
            self.check_up()?;
            self.record(format!("method:{}", descriptor.method_name));
            Ok(GlobalId(self.issue_id()))
        }

        async fn register_sensor_type(
            &self,
            _platform: PlatformId,
            descriptor: &SensorTypeDescriptor,
        ) -> Result<GlobalId, ConnectionError> {
            self.check_up()?;
            self.record(format!("sensor_type:{}", descriptor.name));
            Ok(GlobalId(self.issue_id()))
        }

        async fn add_sensor_type_to_method(
            &self,
            sensor_type: GlobalId,
            method: GlobalId,
        ) -> Result<(), ConnectionError> {
            self.check_up()?;
            self.record(format!("assoc:{sensor_type}:{method}"));
            Ok(())
        }

        async fn send_batch(&self, _records: &[SensorRecord]) -> Result<(), ConnectionError> {
            self.check_up()
        }
    }

    fn worker(
        registry: &Arc<IdentifierRegistry>,
        connection: &Arc<ScriptedConnection>,
    ) -> RegistrationWorker<ScriptedConnection> {
        RegistrationWorker::new(
            Arc::clone(registry),
            Arc::clone(connection),
            "test-agent".to_string(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_drain_registers_platform_first() {
        let registry = Arc::new(IdentifierRegistry::new());
        let connection = Arc::new(ScriptedConnection::new());
        registry.local_method_id(&MethodDescriptor::new("acme.Service", "handle"));

        worker(&registry, &connection).drain().await.expect("drains");

        let calls = connection.calls.lock().expect("lock").clone();
        assert!(calls[0].starts_with("platform:"));
        assert_eq!(calls[1], "method:handle");
        assert!(registry.platform_id().is_ok());
    }

    #[tokio::test]
    async fn test_association_waits_for_both_ends() {
        let registry = Arc::new(IdentifierRegistry::new());
        let connection = Arc::new(ScriptedConnection::new());

        let method = registry.local_method_id(&MethodDescriptor::new("acme.Service", "handle"));
        let sensor_type = registry.local_sensor_type_id(&SensorTypeDescriptor::new("timer"));
        registry.register_association(sensor_type, method);

        worker(&registry, &connection).drain().await.expect("drains");

        // Association came strictly after both ends were registered.
        let calls = connection.calls.lock().expect("lock").clone();
        let method_pos = calls.iter().position(|c| c == "method:handle").expect("m");
        let st_pos = calls
            .iter()
            .position(|c| c == "sensor_type:timer")
            .expect("st");
        let assoc_pos = calls
            .iter()
            .position(|c| c.starts_with("assoc:"))
            .expect("assoc");
        assert!(assoc_pos > method_pos && assoc_pos > st_pos);
        assert!(!registry.has_pending());
    }

    #[tokio::test]
    async fn test_association_for_unknown_ids_is_dropped() {
        let registry = Arc::new(IdentifierRegistry::new());
        let connection = Arc::new(ScriptedConnection::new());

        // Neither end was ever assigned through the registry.
        registry.register_association(LocalId(77), LocalId(88));

        worker(&registry, &connection).drain().await.expect("drains");

        let (_, _, associations) = registry.pending_counts();
        assert_eq!(associations, 0);
        let calls = connection.calls.lock().expect("lock").clone();
        assert!(!calls.iter().any(|c| c.starts_with("assoc:")));
    }

    #[tokio::test]
    async fn test_failure_sets_flag_and_preserves_queue() {
        let registry = Arc::new(IdentifierRegistry::new());
        let connection = Arc::new(ScriptedConnection::new());
        connection.fail_everything.store(true, Ordering::Relaxed);

        registry.local_method_id(&MethodDescriptor::new("acme.Service", "handle"));

        let w = worker(&registry, &connection);
        assert!(w.drain().await.is_err());
        registry.set_registration_failing(true);

        let (methods, _, _) = registry.pending_counts();
        assert_eq!(methods, 1);
        assert_eq!(registry.platform_id(), Err(IdError::RegistrationFailing));

        // Connectivity returns; the same drain picks up where it left off.
        connection.fail_everything.store(false, Ordering::Relaxed);
        w.drain().await.expect("drains after recovery");
        registry.set_registration_failing(false);
        assert!(!registry.has_pending());
        assert!(registry
            .global_method_id(LocalId(1))
            .is_ok());
    }

    #[tokio::test]
    async fn test_worker_loop_shutdown() {
        let registry = Arc::new(IdentifierRegistry::new());
        let connection = Arc::new(ScriptedConnection::new());
        let cancel = CancellationToken::new();

        let handle = worker(&registry, &connection).spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits promptly")
            .expect("join");
    }
}
