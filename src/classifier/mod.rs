pub mod policy;
pub mod resolve;

use alloy_primitives::{Address, U256};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use crate::classifier::policy::DisplayPolicy;
use crate::classifier::resolve::{CollectionResolver, NameLookup};
use crate::correlator::AggregateSnapshot;
use crate::models::errors::ClassifyError;
use crate::models::event::{CollectionRef, EventKind, EventSource, LogicalEvent};
use crate::models::log::RawLogRecord;
use crate::watcher::chain::ChainNode;

/// Turns correlated transactions into logical events.
pub struct Classifier {
    resolver: Arc<CollectionResolver>,
    policy: DisplayPolicy,
}

impl Classifier {
    pub fn new(resolver: Arc<CollectionResolver>, policy: DisplayPolicy) -> Self {
        Self { resolver, policy }
    }

    /// Classifies the transaction `snapshot` was taken of, with `trigger`
    /// being the log that created its aggregate. Fails only if the
    /// transaction value cannot be fetched, in which case the transaction is
    /// abandoned.
    pub async fn classify(
        &self,
        snapshot: &AggregateSnapshot,
        trigger: &RawLogRecord,
        node: &dyn ChainNode,
    ) -> Result<LogicalEvent, ClassifyError> {
        let topic = trigger.topic();
        let transfer = trigger.parse_transfer();
        let (from, to, token_id) = match &transfer {
            Some(transfer) => (
                transfer.from,
                transfer.to,
                transfer.token_ids.first().copied().unwrap_or_default(),
            ),
            None => (Address::ZERO, Address::ZERO, U256::ZERO),
        };

        let (kind, value) = if transfer.is_none() {
            (EventKind::Unknown, U256::ZERO)
        } else if from == Address::ZERO {
            // value is only fetched for non-mints
            (EventKind::Mint, U256::ZERO)
        } else {
            let value = node.transaction_value(trigger.tx_hash).await.inspect_err(|e| {
                debug!("🗑️ {:#x} | getting tx details failed: {}", trigger.tx_hash, e);
            })?;

            if value.is_zero() {
                (EventKind::Transfer, value)
            } else {
                (EventKind::Sale, value)
            }
        };

        let lookup = if topic.is_multi_token() {
            NameLookup::Node(node)
        } else {
            NameLookup::CacheOnly
        };
        let collection = self.resolver.resolve(trigger.address, topic, lookup).await;

        let printable = self.policy.is_printable(kind, value, &collection);
        if !printable {
            debug!(
                "{:#x} | {} in {} is not shown",
                trigger.tx_hash, kind, collection.name
            );
        }

        Ok(LogicalEvent {
            kind,
            source: EventSource::Node(trigger.source),
            tx_hash: Some(snapshot.tx_hash),
            collection: CollectionRef {
                address: collection.address,
                name: collection.name,
                source: collection.source,
            },
            token_id,
            value,
            item_count: snapshot.item_count().max(1),
            from,
            to,
            printable,
            timestamp: Utc::now(),
        })
    }
}
