use alloy_primitives::U256;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::models::event::{EventKind, LogicalEvent};
use crate::utils::wei_to_ether;

/// Counters for one statistics interval. Suppressed events are counted like
/// all others and additionally in `not_shown`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStats {
    pub sales: u64,
    pub sales_volume: U256,
    pub mints: u64,
    pub transfers: u64,
    pub offers: u64,
    pub unknown: u64,
    pub items: u64,
    pub not_shown: u64,
}

impl EventStats {
    pub fn record(&mut self, event: &LogicalEvent) {
        match event.kind {
            EventKind::Sale => {
                self.sales += 1;
                self.sales_volume = self.sales_volume.saturating_add(event.value);
            }
            EventKind::Mint => self.mints += 1,
            EventKind::Transfer => self.transfers += 1,
            EventKind::CollectionOffer => self.offers += 1,
            EventKind::Unknown => self.unknown += 1,
        }

        self.items += event.item_count;
        if !event.printable {
            self.not_shown += 1;
        }
    }

    pub fn events(&self) -> u64 {
        self.sales + self.mints + self.transfers + self.offers + self.unknown
    }
}

#[derive(Default)]
pub struct StatsCollector {
    current: Mutex<EventStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &LogicalEvent) {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event);
    }

    pub fn snapshot(&self) -> EventStats {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the current interval's counters and starts a new interval.
    pub fn take(&self) -> EventStats {
        std::mem::take(&mut *self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Consumes the output channel and logs a summary every `interval`.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Arc<LogicalEvent>>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("📊 statistics skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let stats = self.take();
                    info!(
                        "📊 {} sales ({:.3}Ξ) | {} mints | {} transfers | {} offers | {} items | {} not shown",
                        stats.sales,
                        wei_to_ether(stats.sales_volume),
                        stats.mints,
                        stats.transfers,
                        stats.offers,
                        stats.items,
                        stats.not_shown,
                    );
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Statistics ticker shutting down");
    }
}
