use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::cache::TwoTierCache;
use crate::models::event::LogicalEvent;
use crate::utils::wei_to_ether;

/// Delivers user-facing notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LogicalEvent) -> Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &LogicalEvent) -> Result<()> {
        info!(
            "🔔 {} #{} {} for {:.4}Ξ ({} items)",
            event.collection.name,
            event.token_id,
            event.kind.action_name(),
            wei_to_ether(event.price_per_item()),
            event.item_count
        );
        Ok(())
    }
}

/// Notifies about printable events of the user's own collections, at most
/// once per transaction across all processes sharing the cache.
pub struct NotificationGate {
    cache: Arc<TwoTierCache>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationGate {
    pub fn new(cache: Arc<TwoTierCache>, notifier: Arc<dyn Notifier>) -> Self {
        Self { cache, notifier }
    }

    /// Returns whether a notification was sent.
    pub async fn handle(&self, event: &LogicalEvent) -> bool {
        if !event.printable || !event.is_own_collection() {
            return false;
        }

        let lock_id = event.notification_id();
        if !self.cache.notification_lock(lock_id).await {
            debug!("📣 {:#x} | already notified by another consumer", lock_id);
            return false;
        }

        if let Err(e) = self.notifier.notify(event).await {
            warn!("📣 notification failed: {}", e);
        }
        true
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Arc<LogicalEvent>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        self.handle(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("📣 notification gate skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("Notification gate shutting down");
    }
}
