#![allow(dead_code)]

use alloy_primitives::{Address, B256, Bytes, TxHash, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use nft_event_indexer::models::common::Config;
use nft_event_indexer::models::errors::ClassifyError;
use nft_event_indexer::models::log::{
    RawLogRecord, TRANSFER_SIGNATURE, TRANSFER_SINGLE_SIGNATURE,
};
use nft_event_indexer::watcher::chain::ChainNode;

pub const CONTRACT: Address = Address::repeat_byte(0xaa);

pub fn config(overrides: serde_json::Value) -> Config {
    serde_json::from_value(overrides).unwrap()
}

pub fn ether(milli: u64) -> U256 {
    U256::from(milli) * U256::from(1_000_000_000_000_000u64)
}

fn word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

pub fn erc721_log(tx_hash: TxHash, log_index: u64, from: Address, to: Address, token_id: u64) -> RawLogRecord {
    RawLogRecord {
        address: CONTRACT,
        topics: vec![
            TRANSFER_SIGNATURE,
            from.into_word(),
            to.into_word(),
            word(U256::from(token_id)),
        ],
        data: Bytes::new(),
        tx_hash,
        log_index,
        source: 1,
    }
}

pub fn erc1155_single_log(
    contract: Address,
    tx_hash: TxHash,
    from: Address,
    to: Address,
    token_id: u64,
) -> RawLogRecord {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(word(U256::from(token_id)).as_slice());
    data.extend_from_slice(word(U256::from(1)).as_slice());

    RawLogRecord {
        address: contract,
        topics: vec![
            TRANSFER_SINGLE_SIGNATURE,
            Address::repeat_byte(0x0e).into_word(),
            from.into_word(),
            to.into_word(),
        ],
        data: Bytes::from(data),
        tx_hash,
        log_index: 0,
        source: 1,
    }
}

/// Chain node answering from fixed tables.
#[derive(Default)]
pub struct ScriptedNode {
    values: Mutex<HashMap<TxHash, U256>>,
    names: Mutex<HashMap<Address, String>>,
    pub value_calls: AtomicUsize,
    pub name_calls: AtomicUsize,
}

impl ScriptedNode {
    pub fn with_value(self, tx_hash: TxHash, value: U256) -> Self {
        self.values.lock().unwrap().insert(tx_hash, value);
        self
    }

    pub fn with_name(self, contract: Address, name: &str) -> Self {
        self.names.lock().unwrap().insert(contract, name.to_string());
        self
    }

    pub fn value_calls(&self) -> usize {
        self.value_calls.load(Ordering::SeqCst)
    }

    pub fn name_calls(&self) -> usize {
        self.name_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainNode for ScriptedNode {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn transaction_value(&self, tx_hash: TxHash) -> Result<U256, ClassifyError> {
        self.value_calls.fetch_add(1, Ordering::SeqCst);
        self.values
            .lock()
            .unwrap()
            .get(&tx_hash)
            .copied()
            .ok_or(ClassifyError::TransactionFetch {
                tx_hash,
                reason: "request timed out".to_string(),
            })
    }

    async fn token_name(&self, contract: Address) -> Option<String> {
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        self.names.lock().unwrap().get(&contract).cloned()
    }
}
