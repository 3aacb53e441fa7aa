//! Two-tier cache: a process-local map in front of an optional shared tier.
//!
//! Writes always land in the local tier first and are then propagated to the
//! shared tier on a best-effort basis, so the local tier is never staler than
//! the shared one. Local entries never expire; TTLs only apply to the shared
//! tier.
//!
//! Deployment requirement: several consumer processes only get cross-process
//! notification deduplication when they share a configured shared tier.
//! Without one, [`TwoTierCache::notification_lock`] is process-local.

pub mod redis;
pub mod shared;

use alloy_primitives::{Address, B256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::shared::SharedTier;
use crate::models::common::CacheConfig;
use crate::models::errors::CacheError;
use crate::models::event::{LogicalEvent, RecentEvent};

/// Stored instead of an empty name so "has no name" differs from "not cached".
const NO_NAME_MARKER: &str = "NO-NAME";

const RECENT_EVENTS_CAPACITY: usize = 4096;
const SHARED_EVENTS_PER_COLLECTION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    CollectionName,
    WalletName,
    OpenseaSlug,
    FloorPrice,
    Salira,
    NotificationLock,
    Events,
}

impl KeyClass {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::CollectionName => "contract",
            Self::WalletName => "ens",
            Self::OpenseaSlug => "osslug",
            Self::FloorPrice => "floor",
            Self::Salira => "salira",
            Self::NotificationLock => "notilock",
            Self::Events => "events",
        }
    }
}

/// `{key-class}:{0x-prefixed lowercase hex}`
pub fn cache_key<T: fmt::LowerHex>(class: KeyClass, id: T) -> String {
    format!("{}:{:#x}", class.prefix(), id)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Text(String),
    Number(f64),
}

impl CacheValue {
    fn encode(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ValueKind {
    Text,
    Number,
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub names: Duration,
    pub ens: Duration,
    pub slugs: Duration,
    pub floor: Duration,
    pub salira: Duration,
    pub notifications_lock: Duration,
}

impl From<&CacheConfig> for CacheTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            names: Duration::from_secs(config.names_ttl),
            ens: Duration::from_secs(config.ens_ttl),
            slugs: Duration::from_secs(config.slug_ttl),
            floor: Duration::from_secs(config.floor_ttl),
            salira: Duration::from_secs(config.salira_ttl),
            notifications_lock: Duration::from_secs(config.notifications_lock_ttl),
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

pub struct TwoTierCache {
    local: RwLock<HashMap<String, CacheValue>>,
    local_locks: Mutex<HashMap<String, Instant>>,
    recent: Mutex<VecDeque<RecentEvent>>,
    shared: Option<Arc<dyn SharedTier>>,
    ttls: CacheTtls,
}

impl TwoTierCache {
    pub fn new(shared: Option<Arc<dyn SharedTier>>, ttls: CacheTtls) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            local_locks: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY)),
            shared,
            ttls,
        }
    }

    pub fn local_only(ttls: CacheTtls) -> Self {
        Self::new(None, ttls)
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    pub async fn get_text(&self, key: &str) -> Result<String, CacheError> {
        match self.get(key, ValueKind::Text).await? {
            CacheValue::Text(text) => Ok(text),
            CacheValue::Number(number) => Ok(number.to_string()),
        }
    }

    pub async fn get_number(&self, key: &str) -> Result<f64, CacheError> {
        match self.get(key, ValueKind::Number).await? {
            CacheValue::Number(number) => Ok(number),
            CacheValue::Text(value) => Err(CacheError::NotANumber {
                key: key.to_string(),
                value,
            }),
        }
    }

    async fn get(&self, key: &str, kind: ValueKind) -> Result<CacheValue, CacheError> {
        if let Some(value) = self.local_get(key) {
            debug!("cache | found {} in local tier", key);
            return Ok(value);
        }

        let Some(shared) = &self.shared else {
            return Err(CacheError::NotFound {
                key: key.to_string(),
            });
        };

        match shared.get(key).await {
            Ok(Some(raw)) => {
                let value = match kind {
                    ValueKind::Text => CacheValue::Text(raw),
                    ValueKind::Number => {
                        let number = raw.parse::<f64>().map_err(|_| CacheError::NotANumber {
                            key: key.to_string(),
                            value: raw.clone(),
                        })?;
                        CacheValue::Number(number)
                    }
                };

                debug!("cache | backfilling {} from shared tier", key);
                self.local_put(key, value.clone());
                Ok(value)
            }
            Ok(None) => Err(CacheError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => {
                debug!("cache | shared tier get error for {}: {}", key, e);
                Err(e)
            }
        }
    }

    /// Writes the local tier, then the shared tier with `ttl`. Shared-tier
    /// failures are logged and swallowed.
    pub async fn put(&self, key: &str, value: CacheValue, ttl: Duration) {
        let encoded = value.encode();
        self.local_put(key, value);

        if let Some(shared) = &self.shared {
            match shared.set_ex(key, &encoded, ttl).await {
                Ok(()) => debug!("cache | added {} -> {}", key, encoded),
                Err(e) => warn!("cache | error while adding {} to shared tier: {}", key, e),
            }
        }
    }

    fn local_get(&self, key: &str) -> Option<CacheValue> {
        let local = self.local.read().unwrap_or_else(PoisonError::into_inner);
        local.get(key).cloned()
    }

    fn local_put(&self, key: &str, value: CacheValue) {
        let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
        local.insert(key.to_string(), value);
    }

    async fn put_name(&self, class: KeyClass, address: Address, name: &str, ttl: Duration) {
        let value = if name.is_empty() { NO_NAME_MARKER } else { name };
        self.put(
            &cache_key(class, address),
            CacheValue::Text(value.to_string()),
            ttl,
        )
        .await;
    }

    async fn get_name(&self, class: KeyClass, address: Address) -> Result<String, CacheError> {
        let name = self.get_text(&cache_key(class, address)).await?;
        if name == NO_NAME_MARKER {
            Ok(String::new())
        } else {
            Ok(name)
        }
    }

    pub async fn store_collection_name(&self, address: Address, name: &str) {
        self.put_name(KeyClass::CollectionName, address, name, self.ttls.names)
            .await;
    }

    pub async fn collection_name(&self, address: Address) -> Result<String, CacheError> {
        self.get_name(KeyClass::CollectionName, address).await
    }

    pub async fn store_wallet_name(&self, address: Address, name: &str) {
        self.put_name(KeyClass::WalletName, address, name, self.ttls.ens)
            .await;
    }

    pub async fn wallet_name(&self, address: Address) -> Result<String, CacheError> {
        self.get_name(KeyClass::WalletName, address).await
    }

    pub async fn store_opensea_slug(&self, address: Address, slug: &str) {
        self.put_name(KeyClass::OpenseaSlug, address, slug, self.ttls.slugs)
            .await;
    }

    pub async fn opensea_slug(&self, address: Address) -> Result<String, CacheError> {
        self.get_name(KeyClass::OpenseaSlug, address).await
    }

    pub async fn store_floor(&self, address: Address, floor: f64) {
        let key = cache_key(KeyClass::FloorPrice, address);
        self.put(&key, CacheValue::Number(floor), self.ttls.floor)
            .await;
    }

    pub async fn floor(&self, address: Address) -> Result<f64, CacheError> {
        self.get_number(&cache_key(KeyClass::FloorPrice, address))
            .await
    }

    pub async fn store_salira(&self, address: Address, ratio: f64) {
        let key = cache_key(KeyClass::Salira, address);
        self.put(&key, CacheValue::Number(ratio), self.ttls.salira)
            .await;
    }

    pub async fn salira(&self, address: Address) -> Result<f64, CacheError> {
        self.get_number(&cache_key(KeyClass::Salira, address)).await
    }

    /// Takes the single-use notification lock for `tx_id`. `true` means this
    /// caller owns the notification; `false` means another consumer already
    /// handled it and the caller must stay quiet.
    pub async fn notification_lock(&self, tx_id: B256) -> bool {
        let key = cache_key(KeyClass::NotificationLock, tx_id);
        let ttl = self.ttls.notifications_lock;

        if let Some(shared) = &self.shared {
            let release_key = Uuid::now_v7().to_string();

            match shared.set_nx_ex(&key, &release_key, ttl).await {
                Ok(acquired) => {
                    debug!("📣 {:#x} | locked {}", tx_id, acquired);
                    if acquired {
                        self.local_lock(&key, ttl);
                    }
                    return acquired;
                }
                Err(e) => {
                    warn!(
                        "cache | notification lock for {:#x} fell back to local tier: {}",
                        tx_id, e
                    );
                }
            }
        }

        self.local_lock(&key, ttl)
    }

    /// Expired locks are pruned on every call.
    fn local_lock(&self, key: &str, ttl: Duration) -> bool {
        let mut locks = self
            .local_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        locks.retain(|_, expires_at| *expires_at > now);
        if locks.contains_key(key) {
            return false;
        }

        locks.insert(key.to_string(), now + ttl);
        true
    }

    /// Appends `event` to the recent-event record. Printable or not, every
    /// emitted event lands here.
    pub async fn store_event(&self, event: &LogicalEvent) {
        let recent = RecentEvent::from(event);

        let encoded = match serde_json::to_string(&recent) {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                warn!("cache | failed to encode recent event: {}", e);
                None
            }
        };

        {
            let mut ring = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if ring.len() == RECENT_EVENTS_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(recent);
        }

        if let (Some(shared), Some(encoded)) = (&self.shared, encoded) {
            let key = cache_key(KeyClass::Events, event.collection.address);
            if let Err(e) = shared
                .append(&key, &encoded, SHARED_EVENTS_PER_COLLECTION)
                .await
            {
                warn!("cache | error while appending event to {}: {}", key, e);
            }
        }
    }

    /// Oldest first.
    pub fn recent_events(&self) -> Vec<RecentEvent> {
        let ring = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        ring.iter().cloned().collect()
    }

    /// Drops all process-local state. The shared tier is left untouched.
    pub fn clear_local(&self) {
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.local_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
