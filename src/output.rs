use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use opentelemetry::KeyValue;

use crate::cache::TwoTierCache;
use crate::metrics::Metrics;
use crate::models::event::LogicalEvent;

pub const MAX_CHANNEL_CAPACITY: usize = 1024;

/// Bounded fan-out of logical events. Producers never wait; a consumer that
/// falls more than [`MAX_CHANNEL_CAPACITY`] events behind skips the oldest.
#[derive(Clone)]
pub struct EventOutput {
    events_tx: broadcast::Sender<Arc<LogicalEvent>>,
    shutdown: broadcast::Sender<()>,
    cache: Arc<TwoTierCache>,
    metrics: Option<Arc<Metrics>>,
}

impl EventOutput {
    pub fn new(cache: Arc<TwoTierCache>, metrics: Option<Arc<Metrics>>) -> Self {
        let (events_tx, _) = broadcast::channel(MAX_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            events_tx,
            shutdown,
            cache,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogicalEvent>> {
        self.events_tx.subscribe()
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("Signalling shutdown to all workers");
        // no receivers just means nothing is running anymore
        let _ = self.shutdown.send(());
    }

    /// Records `event` in the recent-event record and hands it to all
    /// consumers, printable or not.
    pub async fn emit(&self, event: LogicalEvent) -> Arc<LogicalEvent> {
        self.cache.store_event(&event).await;

        let event = Arc::new(event);
        if self.events_tx.send(event.clone()).is_err() {
            debug!("no consumer for {} event", event.kind);
        }

        if let Some(metrics) = &self.metrics {
            metrics.events_emitted.add(
                1,
                &[
                    KeyValue::new("instance", metrics.instance.clone()),
                    KeyValue::new("kind", event.kind.to_string()),
                    KeyValue::new("printable", event.printable),
                ],
            );
            metrics.channel_capacity.record(
                self.capacity() as u64,
                &[KeyValue::new("instance", metrics.instance.clone())],
            );
        }

        event
    }

    /// Free slots before the slowest consumer starts lagging.
    pub fn capacity(&self) -> usize {
        MAX_CHANNEL_CAPACITY.saturating_sub(self.events_tx.len())
    }
}
