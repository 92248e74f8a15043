//! Background shipment of collected records.
//!
//! One worker owns the cycle boundary: it swaps the collector on a ticker
//! (or on an explicit flush signal), shapes the drained records through the
//! configured strategy, and ships each batch over the connection. A second
//! ticker refreshes the platform providers into the active cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::connection::Connection;
use crate::platform::PlatformProvider;
use crate::record::{PlatformRecord, SensorRecord};
use crate::registry::IdentifierRegistry;
use crate::strategy::BufferStrategy;

pub struct DeliveryWorker<C> {
    collector: Arc<Collector>,
    registry: Arc<IdentifierRegistry>,
    connection: Arc<C>,
    strategy: Box<dyn BufferStrategy>,
    providers: Vec<Box<dyn PlatformProvider>>,
    send_interval: Duration,
    refresh_interval: Duration,
    flush_signal: Arc<Notify>,
}

impl<C: Connection> DeliveryWorker<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collector: Arc<Collector>,
        registry: Arc<IdentifierRegistry>,
        connection: Arc<C>,
        strategy: Box<dyn BufferStrategy>,
        providers: Vec<Box<dyn PlatformProvider>>,
        send_interval: Duration,
        refresh_interval: Duration,
        flush_signal: Arc<Notify>,
    ) -> Self {
        Self {
            collector,
            registry,
            connection,
            strategy,
            providers,
            send_interval,
            refresh_interval,
            flush_signal,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            strategy = self.strategy.name(),
            send_interval = ?self.send_interval,
            refresh_interval = ?self.refresh_interval,
            "delivery worker started"
        );

        let mut send_ticker = tokio::time::interval(self.send_interval);
        send_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut refresh_ticker = tokio::time::interval(self.refresh_interval);
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Consume the immediate first ticks so startup does not ship an
        // empty cycle.
        send_ticker.tick().await;
        refresh_ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Final flush drains whatever the last cycle gathered.
                    self.refresh_platform_records();
                    self.flush_cycle().await;
                    break;
                }
                _ = send_ticker.tick() => {
                    self.flush_cycle().await;
                }
                _ = refresh_ticker.tick() => {
                    self.refresh_platform_records();
                }
                _ = self.flush_signal.notified() => {
                    self.flush_cycle().await;
                }
            }
        }

        info!("delivery worker stopped");
    }

    /// Swaps the cycle and ships its records batch by batch. A send failure
    /// abandons the remainder of the cycle; delivery is at most once.
    async fn flush_cycle(&self) {
        let records = self.collector.swap_cycle();
        if records.is_empty() {
            return;
        }

        let total = records.len();
        let batches = self.strategy.shape(records);
        let mut shipped = 0usize;
        for batch in &batches {
            if let Err(e) = self.connection.send_batch(batch).await {
                warn!(
                    error = %e,
                    shipped,
                    dropped = total - shipped,
                    "send failed, abandoning rest of cycle"
                );
                return;
            }
            shipped += batch.len();
        }
        debug!(records = total, batches = batches.len(), "cycle shipped");
    }

    /// Re-samples every provider into the active cycle. Providers whose ids
    /// have not resolved yet are skipped until a later tick.
    fn refresh_platform_records(&self) {
        let Ok(platform_id) = self.registry.platform_id() else {
            return;
        };

        for provider in &self.providers {
            let Ok(sensor_type_id) = self.registry.global_sensor_type_id(provider.sensor_type())
            else {
                continue;
            };
            let gauges = provider.collect();
            if gauges.is_empty() {
                debug!(provider = provider.name(), "provider produced no gauges");
                continue;
            }
            self.collector.add(SensorRecord::Platform(PlatformRecord {
                timestamp: Utc::now(),
                platform_id,
                sensor_type_id,
                gauges,
            }));
        }
    }
}
