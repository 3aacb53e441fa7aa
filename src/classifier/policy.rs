use alloy_primitives::U256;

use crate::models::collection::CollectionRecord;
use crate::models::common::ShowConfig;
use crate::models::event::EventKind;
use crate::utils::ether_to_wei;

/// Decides whether an event is presented to the user. Suppressed events are
/// still emitted so statistics keep counting them.
#[derive(Debug, Clone)]
pub struct DisplayPolicy {
    show_mints: bool,
    show_transfers: bool,
    min_value: U256,
}

impl DisplayPolicy {
    pub fn new(show: &ShowConfig) -> Self {
        Self {
            show_mints: show.mints,
            show_transfers: show.transfers,
            min_value: ether_to_wei(show.min_value),
        }
    }

    pub fn is_printable(&self, kind: EventKind, value: U256, collection: &CollectionRecord) -> bool {
        match kind {
            EventKind::Mint => self.show_mints || collection.show.mints,
            EventKind::Unknown => false,
            EventKind::CollectionOffer => true,
            EventKind::Sale | EventKind::Transfer => {
                // own collections ignore the threshold
                if !collection.is_own() && value < self.min_value {
                    return false;
                }

                kind != EventKind::Transfer || self.show_transfers || collection.show.transfers
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::collection::{CollectionSource, ShowOverrides};
    use alloy_primitives::Address;

    fn collection(source: CollectionSource, show: ShowOverrides) -> CollectionRecord {
        let mut record = CollectionRecord::new(Address::with_last_byte(1), "c", source);
        record.show = show;
        record
    }

    fn policy(mints: bool, transfers: bool, min_value: f64) -> DisplayPolicy {
        DisplayPolicy::new(&ShowConfig {
            mints,
            transfers,
            min_value,
        })
    }

    #[test]
    fn test_mints_follow_global_or_collection_override() {
        let stream = collection(CollectionSource::Stream, ShowOverrides::default());
        let overridden = collection(
            CollectionSource::Stream,
            ShowOverrides {
                mints: true,
                transfers: false,
            },
        );

        assert!(!policy(false, false, 0.0).is_printable(EventKind::Mint, U256::ZERO, &stream));
        assert!(policy(true, false, 0.0).is_printable(EventKind::Mint, U256::ZERO, &stream));
        assert!(policy(false, false, 0.0).is_printable(EventKind::Mint, U256::ZERO, &overridden));
    }

    #[test]
    fn test_threshold_skips_own_collections() {
        let stream = collection(CollectionSource::Stream, ShowOverrides::default());
        let own = collection(CollectionSource::Configuration, ShowOverrides::default());
        let cheap = ether_to_wei(0.01);
        let policy = policy(false, false, 0.1);

        assert!(!policy.is_printable(EventKind::Sale, cheap, &stream));
        assert!(policy.is_printable(EventKind::Sale, cheap, &own));
        assert!(policy.is_printable(EventKind::Sale, ether_to_wei(0.5), &stream));
    }

    #[test]
    fn test_transfers_need_their_own_flag() {
        let own = collection(CollectionSource::Wallet, ShowOverrides::default());

        assert!(!policy(false, false, 0.0).is_printable(EventKind::Transfer, U256::ZERO, &own));
        assert!(policy(false, true, 0.0).is_printable(EventKind::Transfer, U256::ZERO, &own));
    }

    #[test]
    fn test_unknown_is_never_printable() {
        let own = collection(
            CollectionSource::Configuration,
            ShowOverrides {
                mints: true,
                transfers: true,
            },
        );
        assert!(!policy(true, true, 0.0).is_printable(EventKind::Unknown, U256::MAX, &own));
    }
}
