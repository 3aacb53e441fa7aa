use alloy_consensus::Transaction as _;
use alloy_network::Ethereum;
use alloy_primitives::{Address, TxHash, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy_rpc_types_eth::{Filter, Log, TransactionInput, TransactionRequest};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::Metrics;
use crate::models::common::NodeConfig;
use crate::models::errors::{ClassifyError, ConfigError};
use crate::models::log::{RawLogRecord, TransferTopic, decode_name, name_call};
use crate::utils::retry::{RetryConfig, retry};

/// The calls the classifier makes against the node a log came from.
#[async_trait]
pub trait ChainNode: Send + Sync {
    fn name(&self) -> &str;

    /// Native value transferred by the transaction. Not retried.
    async fn transaction_value(&self, tx_hash: TxHash) -> Result<U256, ClassifyError>;

    /// The contract's `name()`, if it has one.
    async fn token_name(&self, contract: Address) -> Option<String>;
}

pub struct AlloyNode {
    id: u32,
    name: String,
    provider: DynProvider<Ethereum>,
    metrics: Option<Arc<Metrics>>,
}

impl AlloyNode {
    pub async fn connect(id: u32, config: &NodeConfig, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let url = Url::parse(&config.ws_url).map_err(ConfigError::from)?;

        let retry_config = RetryConfig::default();
        let provider = retry(
            || async {
                ProviderBuilder::new()
                    .connect_ws(WsConnect::new(url.as_str()))
                    .await
                    .map(|provider| provider.erased())
                    .map_err(|e| anyhow!("RPC error: {}", e))
            },
            &retry_config,
            &format!("connect_ws {}", config.name),
        )
        .await?;

        info!("Connected to node {} ({})", config.name, id);

        Ok(Self {
            id,
            name: config.name.clone(),
            provider,
            metrics,
        })
    }

    fn record(&self, method: &'static str, start: Instant, failed: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rpc(&self.name, method, start.elapsed().as_secs_f64(), failed);
        }
    }

    /// Subscribes to all logs carrying one of the transfer signatures.
    pub async fn subscribe_transfers(&self) -> Result<BoxStream<'static, RawLogRecord>> {
        let filter = Filter::new().event_signature(TransferTopic::signatures());

        let start = Instant::now();
        let subscription = self.provider.subscribe_logs(&filter).await;
        self.record("subscribe_logs", start, subscription.is_err());

        let subscription = subscription.map_err(|e| {
            warn!("Failed to subscribe to logs on {}: {}", self.name, e);
            anyhow!("RPC error: {}", e)
        })?;

        let source = self.id;
        let stream = subscription
            .into_stream()
            .filter_map(move |log| async move { raw_log_record(log, source) })
            .boxed();

        Ok(stream)
    }
}

fn raw_log_record(log: Log, source: u32) -> Option<RawLogRecord> {
    if log.removed {
        debug!("skipping removed log {:?}", log.transaction_hash);
        return None;
    }

    Some(RawLogRecord {
        address: log.inner.address,
        topics: log.topics().to_vec(),
        data: log.inner.data.data.clone(),
        tx_hash: log.transaction_hash?,
        log_index: log.log_index?,
        source,
    })
}

#[async_trait]
impl ChainNode for AlloyNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transaction_value(&self, tx_hash: TxHash) -> Result<U256, ClassifyError> {
        let start = Instant::now();
        let result = self.provider.get_transaction_by_hash(tx_hash).await;
        self.record("get_transaction_by_hash", start, result.is_err());

        match result {
            Ok(Some(tx)) => Ok(tx.value()),
            Ok(None) => Err(ClassifyError::MissingTransaction { tx_hash }),
            Err(e) => Err(ClassifyError::TransactionFetch {
                tx_hash,
                reason: e.to_string(),
            }),
        }
    }

    async fn token_name(&self, contract: Address) -> Option<String> {
        let request = TransactionRequest::default()
            .to(contract)
            .input(TransactionInput::new(name_call()));

        let start = Instant::now();
        let result = self.provider.call(request).await;
        self.record("eth_call_name", start, result.is_err());

        match result {
            Ok(output) => decode_name(&output),
            Err(e) => {
                debug!("failed to get collection name for {:#x}: {}", contract, e);
                None
            }
        }
    }
}
