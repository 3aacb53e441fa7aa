use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCriteria {
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCriteria {
    pub address: Address,
}

/// Payload of a `collection_offer` event from the marketplace feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOffer {
    #[serde(deserialize_with = "deserialize_wei")]
    pub base_price: U256,
    #[serde(default = "default_quantity")]
    pub quantity: u64,
    pub expiration_date: DateTime<Utc>,
    pub event_timestamp: DateTime<Utc>,
    pub maker: Account,
    pub collection: CollectionCriteria,
    pub asset_contract_criteria: ContractCriteria,
    #[serde(default)]
    pub order_hash: Option<B256>,
}

impl CollectionOffer {
    pub fn contract(&self) -> Address {
        self.asset_contract_criteria.address
    }

    /// Price of a single item of a multi-quantity offer.
    pub fn unit_price(&self) -> U256 {
        if self.quantity > 1 {
            self.base_price / U256::from(self.quantity)
        } else {
            self.base_price
        }
    }
}

fn default_quantity() -> u64 {
    1
}

/// Accepts prices as decimal strings (the feed's format), hex strings or numbers.
fn deserialize_wei<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u128),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(U256::from(n)),
        Raw::Text(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16),
                None => U256::from_str_radix(&s, 10),
            };
            parsed.map_err(serde::de::Error::custom)
        }
    }
}
