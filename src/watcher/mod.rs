pub mod chain;

use anyhow::Result;
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::correlator::{Admission, TransactionRegistry};
use crate::metrics::Metrics;
use crate::models::event::LogicalEvent;
use crate::models::log::RawLogRecord;
use crate::output::{EventOutput, MAX_CHANNEL_CAPACITY};
use crate::utils::retry::ReconnectBackoff;
use crate::watcher::chain::{AlloyNode, ChainNode};

/// Per-log work: correlate, wait for siblings, classify, emit.
pub struct LogPipeline {
    registry: Arc<TransactionRegistry>,
    classifier: Arc<Classifier>,
    output: EventOutput,
    window: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl LogPipeline {
    pub fn new(
        registry: Arc<TransactionRegistry>,
        classifier: Arc<Classifier>,
        output: EventOutput,
        window: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            registry,
            classifier,
            output,
            window,
            metrics,
        }
    }

    /// Returns the emitted event if this call was the one classifying the
    /// transaction.
    pub async fn handle_log(
        &self,
        record: RawLogRecord,
        node: &dyn ChainNode,
    ) -> Option<Arc<LogicalEvent>> {
        if let Some(metrics) = &self.metrics {
            metrics.logs_received.add(
                1,
                &[
                    KeyValue::new("instance", metrics.instance.clone()),
                    KeyValue::new("node", node.name().to_string()),
                ],
            );
        }

        let aggregate = match self.registry.add_log(record) {
            Admission::First(aggregate) => aggregate,
            Admission::Merged => return None,
            Admission::Duplicate => {
                self.discard("duplicate");
                return None;
            }
            Admission::Evicted => {
                self.discard("evicted");
                return None;
            }
            Admission::Malformed => {
                self.discard("malformed");
                return None;
            }
        };

        // wait for sibling logs handled by other workers
        tokio::time::sleep(self.window).await;

        let snapshot = aggregate.snapshot();
        let trigger = snapshot.logs.first()?.clone();

        match self.classifier.classify(&snapshot, &trigger, node).await {
            Ok(event) => Some(self.output.emit(event).await),
            Err(e) => {
                debug!("🗑️ {:#x} | abandoned: {}", snapshot.tx_hash, e);
                self.discard("tx_fetch");
                None
            }
        }
    }

    fn discard(&self, reason: &'static str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_discarded(reason);
        }
    }
}

/// Feeds one node's transfer logs into `workers` handler tasks until
/// shutdown. Each handled log runs in its own task.
pub async fn run_node(
    node: Arc<AlloyNode>,
    pipeline: Arc<LogPipeline>,
    workers: usize,
    backoff: ReconnectBackoff,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let (logs_tx, logs_rx) = mpsc::channel::<RawLogRecord>(MAX_CHANNEL_CAPACITY);
    let logs_rx = Arc::new(Mutex::new(logs_rx));

    for worker in 0..workers.max(1) {
        let logs_rx = logs_rx.clone();
        let pipeline = pipeline.clone();
        let node = node.clone();

        tokio::spawn(async move {
            loop {
                let record = logs_rx.lock().await.recv().await;
                let Some(record) = record else {
                    debug!("log worker {} of node {} stopped", worker, node.name());
                    break;
                };

                let pipeline = pipeline.clone();
                let node = node.clone();
                tokio::spawn(async move {
                    pipeline.handle_log(record, node.as_ref()).await;
                });
            }
        });
    }

    let mut backoff = backoff;
    let mut shutdown_signal = shutdown.subscribe();

    loop {
        let mut logs = match node.subscribe_transfers().await {
            Ok(logs) => {
                info!("Watching transfer logs on {}", node.name());
                backoff.reset();
                logs
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "Subscribing to {} failed (attempt {}): {}. Retrying in {:?}",
                    node.name(),
                    backoff.attempt(),
                    e,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = shutdown_signal.recv() => break,
                }
            }
        };

        loop {
            tokio::select! {
                next = logs.next() => match next {
                    Some(record) => {
                        if logs_tx.send(record).await.is_err() {
                            error!("All log workers of {} are gone", node.name());
                            return Ok(());
                        }
                    }
                    None => {
                        warn!("Log subscription on {} ended, resubscribing", node.name());
                        break;
                    }
                },
                _ = shutdown_signal.recv() => {
                    info!("Shutting down log watcher for {}", node.name());
                    return Ok(());
                }
            }
        }
    }

    Ok(())
}
