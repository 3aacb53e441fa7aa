use alloy_primitives::Address;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::models::collection::{CollectionRecord, CollectionSource, ShowOverrides};
use crate::models::common::CollectionConfig;

/// Registry of known collections. Records are created lazily and updated in
/// place; they are never removed.
#[derive(Default)]
pub struct CollectionRegistry {
    records: RwLock<HashMap<Address, CollectionRecord>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the registry with the user's configured collections.
    pub fn from_config(collections: &[CollectionConfig]) -> Self {
        let registry = Self::new();

        {
            let mut records = registry.write();
            for config in collections {
                let source = if config.from_wallet {
                    CollectionSource::Wallet
                } else {
                    CollectionSource::Configuration
                };

                let mut record = CollectionRecord::new(config.address, config.name.clone(), source);
                record.show = ShowOverrides {
                    mints: config.show_mints,
                    transfers: config.show_transfers,
                };
                record.opensea_slug = config.slug.clone().filter(|slug| !slug.is_empty());

                records.insert(config.address, record);
            }
        }

        registry
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Address, CollectionRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Address, CollectionRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, address: &Address) -> Option<CollectionRecord> {
        self.read().get(address).cloned()
    }

    /// Inserts `record` unless a record for its address exists already.
    /// Returns the record that ends up in the registry.
    pub fn get_or_insert(&self, record: CollectionRecord) -> CollectionRecord {
        match self.write().entry(record.address) {
            Entry::Occupied(existing) => {
                debug!(
                    "collection {:#x} already registered as '{}'",
                    record.address,
                    existing.get().name
                );
                existing.get().clone()
            }
            Entry::Vacant(slot) => slot.insert(record).clone(),
        }
    }

    /// Updates the name of an existing record. Returns false for unknown addresses.
    pub fn set_name(&self, address: &Address, name: &str) -> bool {
        match self.write().get_mut(address) {
            Some(record) => {
                record.name = name.to_string();
                true
            }
            None => false,
        }
    }

    pub fn by_slug(&self, slug: &str) -> Option<CollectionRecord> {
        self.read()
            .values()
            .find(|record| record.opensea_slug.as_deref() == Some(slug))
            .cloned()
    }

    /// Slugs of the user's own collections.
    pub fn own_slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .read()
            .values()
            .filter(|record| record.is_own())
            .filter_map(|record| record.opensea_slug.clone())
            .collect();
        slugs.sort();
        slugs.dedup();
        slugs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
