//! Agent orchestration: wiring, startup, shutdown.
//!
//! A single context object owns every shared component. There is no
//! module-level state; two agents in one process stay fully independent.

pub mod hooks;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::connection::Connection;
use crate::correlate::ExceptionCorrelator;
use crate::delivery::DeliveryWorker;
use crate::platform::{CpuProvider, MemoryProvider, PlatformProvider};
use crate::registry::worker::RegistrationWorker;
use crate::registry::IdentifierRegistry;
use crate::strategy::{self, BufferStrategy};

pub use hooks::Hooks;

/// Agent orchestrates the shared components and background workers.
pub struct Agent<C> {
    cfg: Config,
    connection: Arc<C>,
    registry: Arc<IdentifierRegistry>,
    collector: Arc<Collector>,
    flush_signal: Arc<Notify>,
    hooks: Hooks,
    /// Consumed by `start()`.
    strategy: Option<Box<dyn BufferStrategy>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<C: Connection> Agent<C> {
    /// Creates the agent, resolving the configured strategy up front so a
    /// bad configuration fails before anything is instrumented.
    pub fn new(cfg: Config, connection: C) -> Result<Self> {
        let strategy = strategy::build(&cfg.delivery.strategy, cfg.delivery.max_records)
            .context("building buffer strategy")?;

        let registry = Arc::new(IdentifierRegistry::new());
        let collector = Arc::new(Collector::new());
        let correlator = Arc::new(ExceptionCorrelator::new(
            Arc::clone(&registry),
            Arc::clone(&collector),
        ));
        let flush_signal = Arc::new(Notify::new());
        let hooks = Hooks::new(
            Arc::clone(&registry),
            Arc::clone(&collector),
            correlator,
            Arc::clone(&flush_signal),
        );

        Ok(Self {
            cfg,
            connection: Arc::new(connection),
            registry,
            collector,
            flush_signal,
            hooks,
            strategy: Some(strategy),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Connects to the collector and spawns the background workers.
    ///
    /// A connection failure is not fatal: the agent starts in degraded mode
    /// and the registration worker keeps retrying on its backoff.
    pub async fn start(&mut self) -> Result<()> {
        let strategy = self
            .strategy
            .take()
            .context("agent already started")?;

        if let Err(e) = self
            .connection
            .connect(&self.cfg.collector.host, self.cfg.collector.port)
            .await
        {
            warn!(
                host = %self.cfg.collector.host,
                port = self.cfg.collector.port,
                error = %e,
                "collector unreachable, starting degraded"
            );
        } else {
            info!(
                host = %self.cfg.collector.host,
                port = self.cfg.collector.port,
                "connected to collector"
            );
        }

        let registration = RegistrationWorker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.connection),
            self.cfg.agent_name.clone(),
            self.cfg.registration.backoff,
        );
        self.handles.push(registration.spawn(self.cancel.clone()));

        let delivery = DeliveryWorker::new(
            Arc::clone(&self.collector),
            Arc::clone(&self.registry),
            Arc::clone(&self.connection),
            strategy,
            self.build_providers(),
            self.cfg.delivery.send_interval,
            self.cfg.delivery.refresh_interval,
            Arc::clone(&self.flush_signal),
        );
        self.handles.push(delivery.spawn(self.cancel.clone()));

        info!(agent = %self.cfg.agent_name, "agent started");
        Ok(())
    }

    /// Signals every worker to stop and waits for their final flushes.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked during shutdown");
            }
        }
        info!("agent stopped");
        Ok(())
    }

    /// Returns the call-site facade. Cheap to clone, safe to hand to any
    /// instrumented thread; all clones share the same frame state.
    pub fn hooks(&self) -> Hooks {
        self.hooks.clone()
    }

    pub fn registry(&self) -> &Arc<IdentifierRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Providers follow the platform section of the config; each one
    /// registers its own sensor type eagerly.
    fn build_providers(&self) -> Vec<Box<dyn PlatformProvider>> {
        use crate::connection::SensorTypeDescriptor;

        let mut providers: Vec<Box<dyn PlatformProvider>> = Vec::new();
        if self.cfg.platform.memory {
            let sensor_type = self
                .registry
                .local_sensor_type_id(&SensorTypeDescriptor::new("platform.memory"));
            providers.push(Box::new(MemoryProvider::new(sensor_type)));
        }
        if self.cfg.platform.cpu {
            let sensor_type = self
                .registry
                .local_sensor_type_id(&SensorTypeDescriptor::new("platform.cpu"));
            providers.push(Box::new(CpuProvider::new(sensor_type)));
        }
        providers
    }
}
