use alloy_primitives::{Address, B256, Bytes, TxHash, U256};
use alloy_sol_types::{SolCall, SolEvent};
use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::models::abi;

/// `Transfer(address,address,uint256)`, shared by ERC-20 and ERC-721. Only the
/// ERC-721 variant carries the token id as a fourth (indexed) topic.
pub const TRANSFER_SIGNATURE: B256 = abi::Transfer::SIGNATURE_HASH;
pub const TRANSFER_SINGLE_SIGNATURE: B256 = abi::TransferSingle::SIGNATURE_HASH;
pub const TRANSFER_BATCH_SIGNATURE: B256 = abi::TransferBatch::SIGNATURE_HASH;

/// ERC-20: topics 0-2, ERC-721/1155: topics 0-3
pub const TRANSFER_TOPIC_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferTopic {
    Transfer,
    TransferSingle,
    TransferBatch,
    Unknown,
}

impl TransferTopic {
    pub fn from_signature(signature: &B256) -> Self {
        if *signature == TRANSFER_SIGNATURE {
            Self::Transfer
        } else if *signature == TRANSFER_SINGLE_SIGNATURE {
            Self::TransferSingle
        } else if *signature == TRANSFER_BATCH_SIGNATURE {
            Self::TransferBatch
        } else {
            Self::Unknown
        }
    }

    pub fn signatures() -> Vec<B256> {
        vec![
            TRANSFER_SIGNATURE,
            TRANSFER_SINGLE_SIGNATURE,
            TRANSFER_BATCH_SIGNATURE,
        ]
    }

    pub fn is_multi_token(&self) -> bool {
        matches!(self, Self::TransferSingle | Self::TransferBatch)
    }
}

impl fmt::Display for TransferTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transfer => "Transfer",
            Self::TransferSingle => "TransferSingle",
            Self::TransferBatch => "TransferBatch",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One log entry as delivered by an upstream log source. Never mutated after
/// it has been observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub tx_hash: TxHash,
    pub log_index: u64,
    pub source: u32,
}

/// Sender, recipient and token ids carried by a single transfer log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTransfer {
    pub topic: TransferTopic,
    pub from: Address,
    pub to: Address,
    pub token_ids: Vec<U256>,
}

impl RawLogRecord {
    pub fn has_transfer_shape(&self) -> bool {
        self.topics.len() == TRANSFER_TOPIC_COUNT
    }

    pub fn topic(&self) -> TransferTopic {
        self.topics
            .first()
            .map(TransferTopic::from_signature)
            .unwrap_or(TransferTopic::Unknown)
    }

    /// Decodes sender, recipient and token ids. Returns `None` for records
    /// without the 4-topic transfer shape, with an unknown signature or with
    /// data that does not decode.
    pub fn parse_transfer(&self) -> Option<ParsedTransfer> {
        if !self.has_transfer_shape() {
            return None;
        }

        let topic = self.topic();
        let topics = self.topics.iter().copied();
        let decoded = match topic {
            TransferTopic::Transfer => abi::Transfer::decode_raw_log(topics, &self.data)
                .map(|event| (event.from, event.to, vec![event.tokenId])),
            TransferTopic::TransferSingle => {
                abi::TransferSingle::decode_raw_log(topics, &self.data)
                    .map(|event| (event.from, event.to, vec![event.id]))
            }
            TransferTopic::TransferBatch => {
                abi::TransferBatch::decode_raw_log(topics, &self.data)
                    .map(|event| (event.from, event.to, event.ids))
            }
            TransferTopic::Unknown => return None,
        };

        match decoded {
            Ok((from, to, token_ids)) => Some(ParsedTransfer {
                topic,
                from,
                to,
                token_ids,
            }),
            Err(e) => {
                debug!(
                    "{:#x} | undecodable {} log {}: {}",
                    self.tx_hash, topic, self.log_index, e
                );
                None
            }
        }
    }
}

/// Calldata for the contract's `name()`.
pub fn name_call() -> Bytes {
    Bytes::from(abi::nameCall {}.abi_encode())
}

/// Decodes the return value of `name()`. Blank names count as missing.
pub fn decode_name(output: &[u8]) -> Option<String> {
    abi::nameCall::abi_decode_returns(output)
        .ok()
        .map(|name| name.trim_matches(char::from(0)).trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloy_primitives::b256;

    pub fn word(value: u64) -> [u8; 32] {
        U256::from(value).to_be_bytes::<32>()
    }

    pub fn erc721_log(
        tx_hash: TxHash,
        log_index: u64,
        from: Address,
        to: Address,
        token_id: u64,
    ) -> RawLogRecord {
        RawLogRecord {
            address: Address::repeat_byte(0xaa),
            topics: vec![
                TRANSFER_SIGNATURE,
                from.into_word(),
                to.into_word(),
                B256::from(word(token_id)),
            ],
            data: Bytes::new(),
            tx_hash,
            log_index,
            source: 1,
        }
    }

    #[test]
    fn test_parse_erc721_transfer() {
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);
        let log = erc721_log(TxHash::repeat_byte(0xab), 3, from, to, 42);

        let parsed = log.parse_transfer().unwrap();
        assert_eq!(parsed.topic, TransferTopic::Transfer);
        assert_eq!(parsed.from, from);
        assert_eq!(parsed.to, to);
        assert_eq!(parsed.token_ids, vec![U256::from(42)]);
    }

    #[test]
    fn test_parse_transfer_single_reads_id_from_data() {
        let operator = Address::repeat_byte(0x09);
        let from = Address::repeat_byte(0x01);
        let to = Address::repeat_byte(0x02);

        let mut data = Vec::new();
        data.extend_from_slice(&word(7)); // id
        data.extend_from_slice(&word(5)); // value

        let log = RawLogRecord {
            address: Address::repeat_byte(0xbb),
            topics: vec![
                TRANSFER_SINGLE_SIGNATURE,
                operator.into_word(),
                from.into_word(),
                to.into_word(),
            ],
            data: Bytes::from(data),
            tx_hash: TxHash::repeat_byte(0x01),
            log_index: 0,
            source: 1,
        };

        let parsed = log.parse_transfer().unwrap();
        assert_eq!(parsed.from, from);
        assert_eq!(parsed.to, to);
        assert_eq!(parsed.token_ids, vec![U256::from(7)]);
    }

    #[test]
    fn test_parse_transfer_batch_decodes_id_array() {
        let mut data = Vec::new();
        data.extend_from_slice(&word(64)); // ids offset
        data.extend_from_slice(&word(160)); // values offset
        data.extend_from_slice(&word(2)); // ids length
        data.extend_from_slice(&word(11));
        data.extend_from_slice(&word(12));
        data.extend_from_slice(&word(2)); // values length
        data.extend_from_slice(&word(1));
        data.extend_from_slice(&word(1));

        let log = RawLogRecord {
            address: Address::repeat_byte(0xbb),
            topics: vec![
                TRANSFER_BATCH_SIGNATURE,
                B256::ZERO,
                B256::ZERO,
                Address::repeat_byte(0x02).into_word(),
            ],
            data: Bytes::from(data),
            tx_hash: TxHash::repeat_byte(0x01),
            log_index: 0,
            source: 1,
        };

        let parsed = log.parse_transfer().unwrap();
        assert_eq!(parsed.from, Address::ZERO);
        assert_eq!(parsed.token_ids, vec![U256::from(11), U256::from(12)]);
    }

    #[test]
    fn test_erc20_shape_is_rejected() {
        let mut log = erc721_log(TxHash::ZERO, 0, Address::ZERO, Address::ZERO, 1);
        log.topics.truncate(3);

        assert!(!log.has_transfer_shape());
        assert!(log.parse_transfer().is_none());
    }

    #[test]
    fn test_truncated_batch_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&word(64));
        data.extend_from_slice(&word(160));
        data.extend_from_slice(&word(2)); // ids length, ids missing

        let log = RawLogRecord {
            address: Address::repeat_byte(0xbb),
            topics: vec![
                TRANSFER_BATCH_SIGNATURE,
                B256::ZERO,
                B256::ZERO,
                Address::repeat_byte(0x02).into_word(),
            ],
            data: Bytes::from(data),
            tx_hash: TxHash::repeat_byte(0x01),
            log_index: 0,
            source: 1,
        };

        assert!(log.parse_transfer().is_none());
    }

    #[test]
    fn test_signatures_match_known_hashes() {
        assert_eq!(
            TRANSFER_SIGNATURE,
            b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
        );
        assert_eq!(
            TRANSFER_SINGLE_SIGNATURE,
            b256!("c3d58168c5ae7397731d063d5bbf3d657854427343f4c083240f7aacaa2d0f62")
        );
        assert_eq!(
            TRANSFER_BATCH_SIGNATURE,
            b256!("4a39dc06d4c0dbc64b70af90fd698a233a518aa5d07e595d983b8c0526c8f7fb")
        );
        assert_eq!(name_call(), Bytes::from_static(&[0x06, 0xfd, 0xde, 0x03]));
    }

    #[test]
    fn test_decode_name() {
        let mut data = Vec::new();
        data.extend_from_slice(&word(32));
        data.extend_from_slice(&word(5));
        let mut text = [0u8; 32];
        text[..5].copy_from_slice(b"Punks");
        data.extend_from_slice(&text);

        assert_eq!(decode_name(&data).as_deref(), Some("Punks"));
        assert_eq!(decode_name(&data[..40]), None);

        let mut blank = Vec::new();
        blank.extend_from_slice(&word(32));
        blank.extend_from_slice(&word(0));
        assert_eq!(decode_name(&blank), None);
    }
}
