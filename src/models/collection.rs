use alloy_primitives::{Address, address};
use serde::Serialize;
use std::fmt;

/// ENS base registrar (ERC-721)
pub const ENS_CONTRACT: Address = address!("57f1887a8bf19b14fc0df6fd9b2acc9af147ea85");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionSource {
    /// Discovered from an upstream log or stream event
    Stream,
    /// Listed in the user's configuration
    Configuration,
    /// Derived from one of the user's wallets
    Wallet,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShowOverrides {
    pub mints: bool,
    pub transfers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRecord {
    pub address: Address,
    pub name: String,
    pub source: CollectionSource,
    pub show: ShowOverrides,
    pub opensea_slug: Option<String>,
}

impl CollectionRecord {
    pub fn new(address: Address, name: impl Into<String>, source: CollectionSource) -> Self {
        Self {
            address,
            name: name.into(),
            source,
            show: ShowOverrides::default(),
            opensea_slug: None,
        }
    }

    /// Configured and wallet-derived collections are always displayed.
    pub fn is_own(&self) -> bool {
        matches!(
            self.source,
            CollectionSource::Configuration | CollectionSource::Wallet
        )
    }
}

pub const ENS_NAME: &str = "ENS";

/// Name shown for collections nothing could be resolved for, e.g.
/// `Unknown TransferSingle`.
pub fn placeholder_name(observed: impl fmt::Display) -> String {
    format!("Unknown {}", observed)
}
