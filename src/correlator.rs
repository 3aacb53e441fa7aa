//! Groups raw transfer logs by transaction.
//!
//! The first worker to see a transaction waits one correlation window before
//! reading the aggregate, giving sibling logs delivered to other workers the
//! chance to merge. This is a best-effort window: a log arriving later is
//! still merged but is not part of the classification that already ran.
//!
//! Swept transactions are remembered for one more retention period, so a log
//! redelivered after the sweep is dropped instead of being classified again.

use alloy_primitives::{Address, TxHash, U256};
use opentelemetry::KeyValue;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::models::log::{RawLogRecord, TransferTopic};

#[derive(Debug, Default)]
struct AggregateState {
    logs: Vec<RawLogRecord>,
    positions: HashSet<u64>,
    token_ids: BTreeSet<U256>,
    from: BTreeSet<Address>,
    to: BTreeSet<Address>,
}

impl AggregateState {
    /// Returns false if a log at the same position was merged before.
    fn merge(&mut self, record: RawLogRecord) -> bool {
        if !self.positions.insert(record.log_index) {
            return false;
        }

        if let Some(transfer) = record.parse_transfer() {
            self.token_ids.extend(transfer.token_ids);
            self.from.insert(transfer.from);
            self.to.insert(transfer.to);
        }

        self.logs.push(record);
        true
    }
}

/// All logs seen so far for one transaction.
#[derive(Debug)]
pub struct TransactionAggregate {
    tx_hash: TxHash,
    first_seen: Instant,
    state: Mutex<AggregateState>,
}

/// Point-in-time view of an aggregate, taken after the correlation window.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub tx_hash: TxHash,
    pub logs: Vec<RawLogRecord>,
    pub token_ids: Vec<U256>,
    pub from: Vec<Address>,
    pub to: Vec<Address>,
}

impl AggregateSnapshot {
    pub fn item_count(&self) -> u64 {
        self.token_ids.len() as u64
    }

    pub fn topic(&self) -> TransferTopic {
        self.logs
            .first()
            .map(RawLogRecord::topic)
            .unwrap_or(TransferTopic::Unknown)
    }
}

impl TransactionAggregate {
    fn with_first(record: RawLogRecord) -> Self {
        let tx_hash = record.tx_hash;
        let mut state = AggregateState::default();
        state.merge(record);

        Self {
            tx_hash,
            first_seen: Instant::now(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn merge(&self, record: RawLogRecord) -> bool {
        self.state().merge(record)
    }

    pub fn unique_token_ids(&self) -> Vec<U256> {
        self.state().token_ids.iter().copied().collect()
    }

    pub fn from_addresses(&self) -> Vec<Address> {
        self.state().from.iter().copied().collect()
    }

    pub fn to_addresses(&self) -> Vec<Address> {
        self.state().to.iter().copied().collect()
    }

    pub fn log_count(&self) -> usize {
        self.state().logs.len()
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let state = self.state();
        AggregateSnapshot {
            tx_hash: self.tx_hash,
            logs: state.logs.clone(),
            token_ids: state.token_ids.iter().copied().collect(),
            from: state.from.iter().copied().collect(),
            to: state.to.iter().copied().collect(),
        }
    }
}

/// Outcome of [`TransactionRegistry::add_log`].
#[derive(Debug)]
pub enum Admission {
    /// Not a 4-topic transfer log; nothing was recorded
    Malformed,
    /// This (transaction, position) pair was merged before
    Duplicate,
    /// Merged into an aggregate another worker is classifying
    Merged,
    /// The transaction was classified and swept already
    Evicted,
    /// First log of the transaction; the caller owns classification
    First(Arc<TransactionAggregate>),
}

#[derive(Default)]
struct RegistryState {
    aggregates: HashMap<TxHash, Arc<TransactionAggregate>>,
    /// Swept transactions and when they were swept
    evicted: HashMap<TxHash, Instant>,
}

#[derive(Default)]
pub struct TransactionRegistry {
    state: Mutex<RegistryState>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_log(&self, record: RawLogRecord) -> Admission {
        if !record.has_transfer_shape() {
            debug!(
                "{:#x} | dropping log with {} topics",
                record.tx_hash,
                record.topics.len()
            );
            return Admission::Malformed;
        }

        let aggregate = {
            let mut state = self.state();
            if state.evicted.contains_key(&record.tx_hash) {
                debug!(
                    "{:#x} | log {} arrived after the transaction was swept",
                    record.tx_hash, record.log_index
                );
                return Admission::Evicted;
            }

            match state.aggregates.entry(record.tx_hash) {
                Entry::Vacant(slot) => {
                    let aggregate = Arc::new(TransactionAggregate::with_first(record));
                    slot.insert(aggregate.clone());
                    return Admission::First(aggregate);
                }
                Entry::Occupied(existing) => existing.get().clone(),
            }
        };

        let tx_hash = record.tx_hash;
        let log_index = record.log_index;
        if aggregate.merge(record) {
            Admission::Merged
        } else {
            debug!("{:#x} | log {} already merged", tx_hash, log_index);
            Admission::Duplicate
        }
    }

    pub fn get(&self, tx_hash: &TxHash) -> Option<Arc<TransactionAggregate>> {
        self.state().aggregates.get(tx_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().aggregates.is_empty()
    }

    /// Evicts aggregates first seen more than `max_age` ago, together with
    /// their dedup sets, and remembers their hashes for another `max_age`.
    /// Returns how many aggregates were evicted.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state();
        let RegistryState {
            aggregates,
            evicted,
        } = &mut *state;

        evicted.retain(|_, swept_at| now.saturating_duration_since(*swept_at) <= max_age);

        let before = aggregates.len();
        aggregates.retain(|tx_hash, aggregate| {
            let keep = now.saturating_duration_since(aggregate.first_seen) <= max_age;
            if !keep {
                evicted.insert(*tx_hash, now);
            }
            keep
        });
        before - aggregates.len()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.aggregates.clear();
        state.evicted.clear();
    }
}

/// Periodically evicts stale aggregates until shutdown.
pub async fn run_sweeper(
    registry: Arc<TransactionRegistry>,
    interval: Duration,
    max_age: Duration,
    metrics: Option<Arc<Metrics>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.sweep(max_age);
                let remaining = registry.len();
                if evicted > 0 {
                    debug!("Evicted {} transaction aggregates, {} remaining", evicted, remaining);
                }
                if let Some(metrics) = &metrics {
                    metrics.tracked_aggregates.record(
                        remaining as u64,
                        &[KeyValue::new("instance", metrics.instance.clone())],
                    );
                }
            }
            _ = shutdown.recv() => {
                info!("Aggregate sweeper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::log::tests::erc721_log;
    use alloy_primitives::B256;

    fn tx() -> TxHash {
        B256::with_last_byte(0xab)
    }

    #[test]
    fn test_malformed_log_is_not_registered() {
        let registry = TransactionRegistry::new();
        let mut record = erc721_log(tx(), 0, Address::ZERO, Address::with_last_byte(1), 1);
        record.topics.pop();

        assert!(matches!(registry.add_log(record), Admission::Malformed));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_first_then_merged_then_duplicate() {
        let registry = TransactionRegistry::new();
        let to = Address::with_last_byte(1);

        let first = registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1));
        let Admission::First(aggregate) = first else {
            panic!("expected first admission");
        };

        assert!(matches!(
            registry.add_log(erc721_log(tx(), 1, Address::ZERO, to, 2)),
            Admission::Merged
        ));
        assert!(matches!(
            registry.add_log(erc721_log(tx(), 1, Address::ZERO, to, 2)),
            Admission::Duplicate
        ));

        assert_eq!(aggregate.log_count(), 2);
        assert_eq!(aggregate.unique_token_ids(), vec![U256::from(1), U256::from(2)]);
        assert_eq!(aggregate.from_addresses(), vec![Address::ZERO]);
        assert_eq!(aggregate.to_addresses(), vec![to]);
    }

    #[test]
    fn test_token_ids_are_order_independent() {
        let forward = TransactionRegistry::new();
        let backward = TransactionRegistry::new();
        let to = Address::with_last_byte(1);

        for (index, id) in [(0, 5), (1, 3), (2, 5)] {
            forward.add_log(erc721_log(tx(), index, Address::ZERO, to, id));
        }
        for (index, id) in [(2, 5), (1, 3), (0, 5)] {
            backward.add_log(erc721_log(tx(), index, Address::ZERO, to, id));
        }

        let a = forward.get(&tx()).unwrap().snapshot();
        let b = backward.get(&tx()).unwrap().snapshot();
        assert_eq!(a.token_ids, b.token_ids);
        assert_eq!(a.item_count(), 2);
    }

    #[test]
    fn test_concurrent_first_sight_creates_one_aggregate() {
        let registry = Arc::new(TransactionRegistry::new());

        let handles: Vec<_> = (0..16u64)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    // every position is delivered twice
                    let record = erc721_log(tx(), i / 2, Address::ZERO, Address::with_last_byte(1), i);
                    matches!(registry.add_log(record), Admission::First(_))
                })
            })
            .collect();

        let firsts = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|first| *first)
            .count();

        assert_eq!(firsts, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&tx()).unwrap().log_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_old_aggregates() {
        let registry = TransactionRegistry::new();
        let to = Address::with_last_byte(1);

        registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1));
        tokio::time::advance(Duration::from_secs(10)).await;
        registry.add_log(erc721_log(B256::with_last_byte(0xcd), 0, Address::ZERO, to, 1));

        assert_eq!(registry.sweep(Duration::from_secs(5)), 1);
        assert!(registry.get(&tx()).is_none());
        assert_eq!(registry.len(), 1);

        // redelivery right after the sweep is not classified again
        assert!(matches!(
            registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1)),
            Admission::Evicted
        ));
        assert!(registry.get(&tx()).is_none());

        // the tombstone outlives the aggregate by one more period
        tokio::time::advance(Duration::from_secs(6)).await;
        registry.sweep(Duration::from_secs(5));
        assert!(matches!(
            registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1)),
            Admission::First(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_forgets_swept_transactions() {
        let registry = TransactionRegistry::new();
        let to = Address::with_last_byte(1);

        registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep(Duration::from_secs(1)), 1);
        registry.clear();

        assert!(matches!(
            registry.add_log(erc721_log(tx(), 0, Address::ZERO, to, 1)),
            Admission::First(_)
        ));
    }
}
