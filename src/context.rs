use std::sync::Arc;
use uuid::Uuid;

use crate::cache::shared::SharedTier;
use crate::cache::{CacheTtls, TwoTierCache};
use crate::classifier::Classifier;
use crate::classifier::policy::DisplayPolicy;
use crate::classifier::resolve::CollectionResolver;
use crate::collections::CollectionRegistry;
use crate::correlator::TransactionRegistry;
use crate::metrics::Metrics;
use crate::models::common::Config;
use crate::offers::{OfferHandler, OfferTracker};
use crate::output::EventOutput;
use crate::stats::StatsCollector;
use crate::watcher::LogPipeline;

/// Everything the pipelines share, built once at startup and passed
/// explicitly.
pub struct AppContext {
    pub config: Config,
    pub instance_id: String,
    pub cache: Arc<TwoTierCache>,
    pub collections: Arc<CollectionRegistry>,
    pub transactions: Arc<TransactionRegistry>,
    pub resolver: Arc<CollectionResolver>,
    pub classifier: Arc<Classifier>,
    pub offers: Arc<OfferTracker>,
    pub output: EventOutput,
    pub stats: Arc<StatsCollector>,
    pub metrics: Option<Arc<Metrics>>,
}

impl AppContext {
    pub fn new(
        config: Config,
        shared: Option<Arc<dyn SharedTier>>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let cache = Arc::new(TwoTierCache::new(shared, CacheTtls::from(&config.cache)));
        let collections = Arc::new(CollectionRegistry::from_config(&config.collections));
        let resolver = Arc::new(CollectionResolver::new(collections.clone(), cache.clone()));
        let classifier = Arc::new(Classifier::new(
            resolver.clone(),
            DisplayPolicy::new(&config.show),
        ));
        let output = EventOutput::new(cache.clone(), metrics.clone());

        Self {
            config,
            instance_id: Uuid::now_v7().to_string(),
            cache,
            collections,
            transactions: Arc::new(TransactionRegistry::new()),
            resolver,
            classifier,
            offers: Arc::new(OfferTracker::new()),
            output,
            stats: Arc::new(StatsCollector::new()),
            metrics,
        }
    }

    pub fn pipeline(&self) -> LogPipeline {
        LogPipeline::new(
            self.transactions.clone(),
            self.classifier.clone(),
            self.output.clone(),
            self.config.correlation.window(),
            self.metrics.clone(),
        )
    }

    pub fn offer_handler(&self) -> OfferHandler {
        OfferHandler::new(
            self.offers.clone(),
            self.resolver.clone(),
            self.output.clone(),
            self.metrics.clone(),
        )
    }

    /// Drops all process-local state: aggregates, top offers, local cache
    /// tier and statistics. Configured collections stay registered.
    pub fn reset(&self) {
        self.transactions.clear();
        self.offers.clear();
        self.cache.clear_local();
        self.stats.take();
    }
}
