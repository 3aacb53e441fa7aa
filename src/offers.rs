//! Best active collection-wide offer per contract.

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::classifier::resolve::{CollectionResolver, NameLookup};
use crate::metrics::Metrics;
use crate::models::event::{CollectionRef, EventKind, EventSource, LogicalEvent};
use crate::models::offer::CollectionOffer;
use crate::output::EventOutput;

/// Anti-flicker buffer in wei (≈0.00667 ether). A new offer must beat the
/// current top by at least this much. All cooperating instances must agree
/// on it or their top offers diverge.
pub const OFFER_BUFFER_WEI: U256 = U256::from_limbs([6_666_666_666_666_666, 0, 0, 0]);

#[derive(Debug, Clone)]
pub struct TopOffer {
    pub unit_price: U256,
    pub expiration: DateTime<Utc>,
    pub offer: CollectionOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// No current top offer
    First,
    /// Current top offer had expired
    ReplacedExpired,
    /// Beat the current top offer by at least the buffer
    Outbid,
    /// Kept the current top offer
    Rejected,
}

impl OfferDecision {
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::First => "first",
            Self::ReplacedExpired => "replaced_expired",
            Self::Outbid => "outbid",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Default)]
pub struct OfferTracker {
    top_offers: Mutex<HashMap<Address, TopOffer>>,
}

impl OfferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares `offer` against the current top offer of its contract and
    /// replaces the top offer if accepted. Check and replace happen under one
    /// lock.
    pub fn consider(&self, offer: &CollectionOffer, now: DateTime<Utc>) -> OfferDecision {
        let contract = offer.contract();
        let unit_price = offer.unit_price();

        let mut top_offers = self.top_offers.lock().unwrap_or_else(PoisonError::into_inner);

        let decision = match top_offers.get(&contract) {
            None => OfferDecision::First,
            Some(top) if top.expiration < now => OfferDecision::ReplacedExpired,
            Some(top) if unit_price >= top.unit_price.saturating_add(OFFER_BUFFER_WEI) => {
                OfferDecision::Outbid
            }
            Some(top) => {
                debug!(
                    "🍭 current top offer (+buffer) higher than incoming bid: {} > {}",
                    top.unit_price.saturating_add(OFFER_BUFFER_WEI),
                    unit_price
                );
                OfferDecision::Rejected
            }
        };

        if decision.accepted() {
            top_offers.insert(
                contract,
                TopOffer {
                    unit_price,
                    expiration: offer.expiration_date,
                    offer: offer.clone(),
                },
            );
        }

        decision
    }

    pub fn top_offer(&self, contract: &Address) -> Option<TopOffer> {
        let top_offers = self.top_offers.lock().unwrap_or_else(PoisonError::into_inner);
        top_offers.get(contract).cloned()
    }

    pub fn clear(&self) {
        self.top_offers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Feeds marketplace collection offers through the tracker and emits an
/// event for every accepted one.
pub struct OfferHandler {
    tracker: Arc<OfferTracker>,
    resolver: Arc<CollectionResolver>,
    output: EventOutput,
    metrics: Option<Arc<Metrics>>,
}

impl OfferHandler {
    pub fn new(
        tracker: Arc<OfferTracker>,
        resolver: Arc<CollectionResolver>,
        output: EventOutput,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            tracker,
            resolver,
            output,
            metrics,
        }
    }

    pub async fn handle_offer(&self, offer: CollectionOffer) -> Option<Arc<LogicalEvent>> {
        let decision = self.tracker.consider(&offer, Utc::now());

        if let Some(metrics) = &self.metrics {
            metrics.offers.add(
                1,
                &[
                    KeyValue::new("instance", metrics.instance.clone()),
                    KeyValue::new("decision", decision.label()),
                ],
            );
        }

        if !decision.accepted() {
            return None;
        }

        debug!("🍭 new top offer for {}: {}", offer.collection.slug, offer.unit_price());

        let collection = self
            .resolver
            .resolve(
                offer.contract(),
                EventKind::CollectionOffer,
                NameLookup::Slug(&offer.collection.slug),
            )
            .await;

        let event = LogicalEvent {
            kind: EventKind::CollectionOffer,
            source: EventSource::Stream,
            tx_hash: offer.order_hash,
            collection: CollectionRef {
                address: collection.address,
                name: collection.name,
                source: collection.source,
            },
            token_id: U256::ZERO,
            value: offer.unit_price(),
            item_count: offer.quantity.max(1),
            from: offer.maker.address,
            to: Address::ZERO,
            printable: true,
            timestamp: offer.event_timestamp,
        };

        Some(self.output.emit(event).await)
    }
}
