use alloy_primitives::Address;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::cache::TwoTierCache;
use crate::collections::CollectionRegistry;
use crate::models::collection::{
    CollectionRecord, CollectionSource, ENS_CONTRACT, ENS_NAME, placeholder_name,
};
use crate::watcher::chain::ChainNode;

/// Where a name for an unknown collection may come from.
pub enum NameLookup<'a> {
    /// Nothing beyond the cache
    CacheOnly,
    /// Ask the originating node for the contract's `name()`
    Node(&'a dyn ChainNode),
    /// Marketplace slug, used as the name when nothing better is cached
    Slug(&'a str),
}

/// Lazily creates collection records for addresses seen for the first time.
pub struct CollectionResolver {
    collections: Arc<CollectionRegistry>,
    cache: Arc<TwoTierCache>,
}

impl CollectionResolver {
    pub fn new(collections: Arc<CollectionRegistry>, cache: Arc<TwoTierCache>) -> Self {
        Self { collections, cache }
    }

    /// Returns the registered record for `address`, creating it on first
    /// sight. Never returns a record with an empty name; `observed` goes into
    /// the placeholder name when nothing could be resolved.
    pub async fn resolve(
        &self,
        address: Address,
        observed: impl fmt::Display,
        lookup: NameLookup<'_>,
    ) -> CollectionRecord {
        if let Some(mut record) = self.collections.get(&address) {
            if record.name.is_empty() {
                record.name = placeholder_name(observed);
                self.collections.set_name(&address, &record.name);
            }
            return record;
        }

        let mut name = self.lookup_name(address, &lookup).await;
        if name.is_empty() {
            name = placeholder_name(observed);
        }

        let mut record = CollectionRecord::new(address, name, CollectionSource::Stream);
        record.opensea_slug = match lookup {
            NameLookup::Slug(slug) => {
                self.cache.store_opensea_slug(address, slug).await;
                Some(slug.to_string())
            }
            _ => self
                .cache
                .opensea_slug(address)
                .await
                .ok()
                .filter(|slug| !slug.is_empty()),
        };

        self.collections.get_or_insert(record)
    }

    async fn lookup_name(&self, address: Address, lookup: &NameLookup<'_>) -> String {
        if address == ENS_CONTRACT {
            return ENS_NAME.to_string();
        }

        match self.cache.collection_name(address).await {
            Ok(name) => return name,
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("collection name lookup for {:#x} failed: {}", address, e),
        }

        match lookup {
            NameLookup::CacheOnly => String::new(),
            NameLookup::Slug(slug) => slug.to_string(),
            NameLookup::Node(node) => {
                let name = node.token_name(address).await.unwrap_or_default();
                if !name.is_empty() {
                    debug!("found token name: {} | {:#x}", name, address);
                }
                // an empty name is cached too, so the node is asked only once
                self.cache.store_collection_name(address, &name).await;
                name
            }
        }
    }
}
