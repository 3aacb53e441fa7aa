//! Management protocol coordinating which marketplace topics the stream
//! owner subscribes to on behalf of its consumers.
//!
//! A consumer publishes `Subscribe` / `Unsubscribe` with its slugs. The stream
//! owner applies the difference to its active subscriptions and answers with
//! an `Ack` addressed to the sender. A starting stream owner publishes
//! `SendSlugs`, asking every consumer to publish its slugs again.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::collections::CollectionRegistry;
use crate::models::errors::StreamError;
use crate::output::MAX_CHANNEL_CAPACITY;
use crate::stream::StreamEventKind;
use crate::utils::retry::ReconnectBackoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MgmtAction {
    Subscribe,
    Unsubscribe,
    SendSlugs,
    Ack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtMessage {
    pub action: MgmtAction,
    /// Empty means all default event kinds
    #[serde(default)]
    pub events: Vec<StreamEventKind>,
    #[serde(default)]
    pub slugs: Vec<String>,
    /// Instance id of the publisher; acks carry the requester's id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl MgmtMessage {
    pub fn new(action: MgmtAction, slugs: Vec<String>, sender: Option<String>) -> Self {
        Self {
            action,
            events: Vec::new(),
            slugs,
            sender,
        }
    }

    pub fn send_slugs(sender: &str) -> Self {
        Self::new(MgmtAction::SendSlugs, Vec::new(), Some(sender.to_string()))
    }
}

/// Pub/sub channel shared by the stream owner and its consumers.
#[async_trait]
pub trait ManagementBus: Send + Sync {
    async fn publish(&self, message: &MgmtMessage) -> Result<(), StreamError>;

    /// Raw payloads of every message published from now on.
    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, StreamError>;
}

/// In-process bus for a stream owner and consumers living in one process.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl Default for LocalBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(MAX_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManagementBus for LocalBus {
    async fn publish(&self, message: &MgmtMessage) -> Result<(), StreamError> {
        let payload = serde_json::to_string(message)?;
        if self.tx.send(payload).is_err() {
            debug!("no listener for {:?} on local bus", message.action);
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, StreamError> {
        let mut bus_rx = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(MAX_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("local mgmt bus listener skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

/// Bus on a redis pub/sub topic.
pub struct RedisBus {
    client: redis::Client,
    conn: ConnectionManager,
    topic: String,
}

impl RedisBus {
    pub async fn connect(url: &str, topic: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl ManagementBus for RedisBus {
    async fn publish(&self, message: &MgmtMessage) -> Result<(), StreamError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        info!(
            "⚓️ 📢 sent {:?} to {} ({} listeners)",
            message.action, self.topic, receivers
        );
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, StreamError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.topic).await?;
        info!("⚓️ subscribed to mgmt channel {}", self.topic);

        let (tx, rx) = mpsc::channel(MAX_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("invalid mgmt payload: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Consumer side: keeps the stream owner informed about the slugs of the
/// user's own collections.
pub struct SlugPublisher {
    bus: Arc<dyn ManagementBus>,
    collections: Arc<CollectionRegistry>,
    instance_id: String,
}

impl SlugPublisher {
    pub fn new(
        bus: Arc<dyn ManagementBus>,
        collections: Arc<CollectionRegistry>,
        instance_id: String,
    ) -> Self {
        Self {
            bus,
            collections,
            instance_id,
        }
    }

    /// Returns the number of slugs published.
    pub async fn publish_slugs(&self) -> Result<usize, StreamError> {
        let slugs = self.collections.own_slugs();
        if slugs.is_empty() {
            debug!("no slugs to publish");
            return Ok(0);
        }

        let count = slugs.len();
        let message = MgmtMessage::new(MgmtAction::Subscribe, slugs, Some(self.instance_id.clone()));
        self.bus.publish(&message).await?;
        Ok(count)
    }

    /// Publishes once, then again for every `SendSlugs` until shutdown. The
    /// slugs are published again after every re-subscribe to a closed bus.
    pub async fn run(self, mut backoff: ReconnectBackoff, mut shutdown: broadcast::Receiver<()>) {
        loop {
            match self.listen(&mut backoff, &mut shutdown).await {
                Ok(()) => {
                    info!("Slug publisher shutting down");
                    return;
                }
                Err(e) => warn!("mgmt bus lost: {}", e),
            }

            let delay = backoff.next_delay();
            warn!(
                "resubscribing to mgmt bus in {:?} (attempt {})",
                delay,
                backoff.attempt()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    info!("Slug publisher shutting down");
                    return;
                }
            }
        }
    }

    /// One bus subscription. `Ok` means shutdown.
    async fn listen(
        &self,
        backoff: &mut ReconnectBackoff,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let mut messages = self.bus.subscribe().await?;
        backoff.reset();

        if let Err(e) = self.publish_slugs().await {
            warn!("failed to publish slugs: {}", e);
        }

        loop {
            tokio::select! {
                payload = messages.recv() => {
                    let Some(payload) = payload else {
                        return Err(StreamError::Closed);
                    };

                    let message: MgmtMessage = match serde_json::from_str(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("invalid mgmt message: {}", e);
                            continue;
                        }
                    };

                    match message.action {
                        MgmtAction::SendSlugs => {
                            if let Err(e) = self.publish_slugs().await {
                                warn!("failed to publish slugs: {}", e);
                            }
                        }
                        MgmtAction::Ack if message.sender.as_deref() == Some(self.instance_id.as_str()) => {
                            info!("⚓️ stream owner applied {} slugs", message.slugs.len());
                        }
                        _ => {}
                    }
                }
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }
}
