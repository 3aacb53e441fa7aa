use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_sol_types::SolValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::models::collection::CollectionSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    Mint,
    Sale,
    Transfer,
    CollectionOffer,
    Unknown,
}

impl EventKind {
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::Mint => "minted",
            Self::Sale => "sold",
            Self::Transfer => "transferred",
            Self::CollectionOffer => "(got) collection-offered",
            Self::Unknown => "did something",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mint => "Mint",
            Self::Sale => "Sale",
            Self::Transfer => "Transfer",
            Self::CollectionOffer => "CollectionOffer",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Where a logical event was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventSource {
    /// Chain node by id
    Node(u32),
    /// Marketplace realtime feed
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRef {
    pub address: Address,
    pub name: String,
    pub source: CollectionSource,
}

/// A classified event ready for downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct LogicalEvent {
    pub kind: EventKind,
    pub source: EventSource,
    /// Transaction hash for on-chain events, order hash for stream offers
    pub tx_hash: Option<B256>,
    pub collection: CollectionRef,
    pub token_id: U256,
    /// Smallest unit (wei)
    pub value: U256,
    pub item_count: u64,
    pub from: Address,
    pub to: Address,
    pub printable: bool,
    pub timestamp: DateTime<Utc>,
}

impl LogicalEvent {
    pub fn price_per_item(&self) -> U256 {
        if self.item_count > 1 {
            self.value / U256::from(self.item_count)
        } else {
            self.value
        }
    }

    pub fn is_own_collection(&self) -> bool {
        matches!(
            self.collection.source,
            CollectionSource::Configuration | CollectionSource::Wallet
        )
    }

    /// Key of the once-only notification lock: the transaction or order
    /// hash, else a digest of the fields every consumer of the same stream
    /// event sees alike.
    pub fn notification_id(&self) -> B256 {
        if let Some(tx_hash) = self.tx_hash {
            return tx_hash;
        }

        let fields = (
            self.kind.to_string(),
            self.collection.address,
            self.from,
            self.value,
            self.item_count,
            self.timestamp.timestamp_micros(),
        );
        keccak256(fields.abi_encode())
    }
}

/// Compact form kept in the recent-event record for statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEvent {
    pub kind: EventKind,
    pub contract: Address,
    pub collection_name: String,
    pub token_id: U256,
    pub value: U256,
    pub item_count: u64,
    pub printable: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&LogicalEvent> for RecentEvent {
    fn from(event: &LogicalEvent) -> Self {
        Self {
            kind: event.kind,
            contract: event.collection.address,
            collection_name: event.collection.name.clone(),
            token_id: event.token_id,
            value: event.value,
            item_count: event.item_count,
            printable: event.printable,
            timestamp: event.timestamp,
        }
    }
}
