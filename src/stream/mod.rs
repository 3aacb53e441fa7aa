//! Marketplace realtime feed: subscription registry and management.

pub mod mgmt;
pub mod phoenix;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::models::errors::StreamError;
use crate::models::offer::CollectionOffer;
use crate::offers::OfferHandler;
use crate::stream::mgmt::{MgmtAction, MgmtMessage, ManagementBus};
use crate::stream::phoenix::MarketplaceEvent;
use crate::utils::retry::ReconnectBackoff;

pub const COLLECTION_TOPIC_PREFIX: &str = "collection:";

/// Never subscribed through the management channel.
const SKIPPED_SLUG: &str = "ens";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    ItemListed,
    ItemSold,
    ItemReceivedOffer,
    ItemReceivedBid,
    CollectionOffer,
}

impl StreamEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ItemListed => "item_listed",
            Self::ItemSold => "item_sold",
            Self::ItemReceivedOffer => "item_received_offer",
            Self::ItemReceivedBid => "item_received_bid",
            Self::CollectionOffer => "collection_offer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "item_listed" => Some(Self::ItemListed),
            "item_sold" => Some(Self::ItemSold),
            "item_received_offer" => Some(Self::ItemReceivedOffer),
            "item_received_bid" => Some(Self::ItemReceivedBid),
            "collection_offer" => Some(Self::CollectionOffer),
            _ => None,
        }
    }

    /// Kinds subscribed when a management message names none.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::ItemListed,
            Self::ItemSold,
            Self::ItemReceivedOffer,
            Self::CollectionOffer,
        ]
    }
}

impl fmt::Display for StreamEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn collection_topic(slug: &str) -> String {
    format!("{}{}", COLLECTION_TOPIC_PREFIX, slug)
}

/// Join/leave semantics of the realtime feed.
#[async_trait]
pub trait ChannelSocket: Send + Sync {
    /// Starts forwarding `kind` events of `topic`, joining it if needed.
    async fn join(&self, topic: &str, kind: StreamEventKind) -> Result<(), StreamError>;

    /// Stops forwarding `kind` events, leaving `topic` after its last kind.
    async fn leave(&self, topic: &str, kind: StreamEventKind) -> Result<(), StreamError>;
}

/// Capability to undo one subscription.
pub struct Unsubscribe {
    socket: Arc<dyn ChannelSocket>,
    topic: String,
    kind: StreamEventKind,
}

impl Unsubscribe {
    pub async fn invoke(self) {
        info!("Unsubscribing from {} events on {}", self.kind, self.topic);
        if let Err(e) = self.socket.leave(&self.topic, self.kind).await {
            warn!("leaving {} failed: {}", self.topic, e);
        }
    }
}

type SubscriptionKey = (StreamEventKind, String);

pub struct SubscriptionManager {
    socket: Arc<dyn ChannelSocket>,
    /// `None` marks a pair that was subscribed before
    subscriptions: Mutex<HashMap<SubscriptionKey, Option<Unsubscribe>>>,
    has_api_key: bool,
    subscribe_delay: Duration,
}

impl SubscriptionManager {
    pub fn new(socket: Arc<dyn ChannelSocket>, has_api_key: bool, subscribe_delay: Duration) -> Self {
        Self {
            socket,
            subscriptions: Mutex::new(HashMap::new()),
            has_api_key,
            subscribe_delay,
        }
    }

    /// Returns false if the pair is already subscribed or joining fails.
    pub async fn subscribe_for_slug(&self, kind: StreamEventKind, slug: &str) -> bool {
        let key = (kind, slug.to_string());
        let mut subscriptions = self.subscriptions.lock().await;

        if matches!(subscriptions.get(&key), Some(Some(_))) {
            debug!("☕️ already subscribed to {} for {}", kind, slug);
            return false;
        }

        let topic = collection_topic(slug);
        if let Err(e) = self.socket.join(&topic, kind).await {
            warn!("subscribing to {} for {} failed: {}", kind, slug, e);
            return false;
        }

        subscriptions.insert(
            key,
            Some(Unsubscribe {
                socket: self.socket.clone(),
                topic,
                kind,
            }),
        );
        true
    }

    /// Returns false if the pair is not subscribed.
    pub async fn unsubscribe_for_slug(&self, kind: StreamEventKind, slug: &str) -> bool {
        let key = (kind, slug.to_string());
        let mut subscriptions = self.subscriptions.lock().await;

        let Some(unsubscribe) = subscriptions.get_mut(&key).and_then(Option::take) else {
            debug!("☕️ not subscribed to {} for {} (anymore)", kind, slug);
            return false;
        };

        unsubscribe.invoke().await;
        true
    }

    pub async fn active_subscriptions(&self) -> Vec<(StreamEventKind, String)> {
        let subscriptions = self.subscriptions.lock().await;
        let mut active: Vec<_> = subscriptions
            .iter()
            .filter(|(_, unsubscribe)| unsubscribe.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        active.sort();
        active
    }

    /// Applies a management message. Returns the acknowledgement to publish,
    /// if any.
    pub async fn handle_mgmt(&self, message: MgmtMessage) -> Option<MgmtMessage> {
        let subscribe = match message.action {
            MgmtAction::Subscribe => true,
            MgmtAction::Unsubscribe => false,
            // only consumers react to these
            MgmtAction::SendSlugs | MgmtAction::Ack => return None,
        };

        info!(
            "⚓️ ␚ received {:?} for {} collections/slugs",
            message.action,
            message.slugs.len()
        );

        if message.slugs.is_empty() {
            warn!("⚓️❌ incoming collection slugs msg is empty");
            return None;
        }

        if !self.has_api_key {
            warn!("⚓️❌ stream api key is not set, can't apply {:?}", message.action);
            return None;
        }

        let kinds = if message.events.is_empty() {
            StreamEventKind::defaults()
        } else {
            message.events.clone()
        };

        let mut applied_slugs: Vec<String> = Vec::new();
        let mut applied = 0;

        for slug in &message.slugs {
            if slug == SKIPPED_SLUG {
                info!("⚓️ ␚ skipping {}", slug);
                continue;
            }

            for kind in &kinds {
                let changed = if subscribe {
                    self.subscribe_for_slug(*kind, slug).await
                } else {
                    self.unsubscribe_for_slug(*kind, slug).await
                };

                if changed {
                    applied += 1;
                    if !applied_slugs.contains(slug) {
                        applied_slugs.push(slug.clone());
                    }
                    // upstream rate limit
                    tokio::time::sleep(self.subscribe_delay).await;
                }
            }
        }

        info!(
            "⚓️ ␚ applied {:?} to {} collections/slugs ({} events in total)",
            message.action,
            applied_slugs.len(),
            applied
        );

        Some(MgmtMessage {
            action: MgmtAction::Ack,
            events: kinds,
            slugs: applied_slugs,
            sender: message.sender,
        })
    }
}

/// Stream owner side of the management protocol: asks all consumers for
/// their slugs, then applies every request until shutdown. A closed bus is
/// re-subscribed with `backoff`, and consumers are asked for their slugs
/// again since requests may have been lost in between.
pub async fn run_manager(
    manager: Arc<SubscriptionManager>,
    bus: Arc<dyn ManagementBus>,
    instance_id: String,
    mut backoff: ReconnectBackoff,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        match manage(&manager, bus.as_ref(), &instance_id, &mut backoff, &mut shutdown).await {
            Ok(()) => {
                info!("Subscription manager shutting down");
                return;
            }
            Err(e) => warn!("⚓️❌ mgmt channel lost: {}", e),
        }

        let delay = backoff.next_delay();
        warn!(
            "⚓️ resubscribing to mgmt channel in {:?} (attempt {})",
            delay,
            backoff.attempt()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                info!("Subscription manager shutting down");
                return;
            }
        }
    }
}

/// One bus subscription. `Ok` means shutdown.
async fn manage(
    manager: &SubscriptionManager,
    bus: &dyn ManagementBus,
    instance_id: &str,
    backoff: &mut ReconnectBackoff,
    shutdown: &mut broadcast::Receiver<()>,
) -> Result<(), StreamError> {
    let mut messages = bus.subscribe().await?;
    bus.publish(&MgmtMessage::send_slugs(instance_id)).await?;
    backoff.reset();

    loop {
        tokio::select! {
            payload = messages.recv() => {
                let Some(payload) = payload else {
                    return Err(StreamError::Closed);
                };
                debug!("⚓️ received mgmt msg: {}", payload);

                let message: MgmtMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("⚓️ dropping invalid mgmt msg: {}", e);
                        continue;
                    }
                };

                if let Some(ack) = manager.handle_mgmt(message).await {
                    if let Err(e) = bus.publish(&ack).await {
                        warn!("⚓️❌ publishing ack failed: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// Routes marketplace events: collection offers go to the offer tracker,
/// everything else is only logged.
pub async fn route_events(
    mut events: mpsc::Receiver<MarketplaceEvent>,
    offers: Arc<OfferHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };

                if event.kind != StreamEventKind::CollectionOffer {
                    debug!("⚓️ {} on {}", event.kind, event.slug);
                    continue;
                }

                // the feed wraps the offer in {"event_type", "payload", "sent_at"}
                let payload = event.payload.get("payload").cloned().unwrap_or(event.payload);
                match serde_json::from_value::<CollectionOffer>(payload) {
                    Ok(offer) => {
                        offers.handle_offer(offer).await;
                    }
                    Err(e) => debug!("⚓️ invalid collection offer on {}: {}", event.slug, e),
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    info!("Marketplace event router shutting down");
}
