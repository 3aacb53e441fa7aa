use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};

use nft_event_indexer::cache::redis::RedisTier;
use nft_event_indexer::cache::shared::SharedTier;
use nft_event_indexer::context::AppContext;
use nft_event_indexer::correlator::run_sweeper;
use nft_event_indexer::metrics::Metrics;
use nft_event_indexer::notify::{LogNotifier, NotificationGate};
use nft_event_indexer::output::MAX_CHANNEL_CAPACITY;
use nft_event_indexer::stream::mgmt::{LocalBus, ManagementBus, RedisBus, SlugPublisher};
use nft_event_indexer::stream::phoenix::PhoenixSocket;
use nft_event_indexer::stream::{SubscriptionManager, route_events, run_manager};
use nft_event_indexer::utils::load_config;
use nft_event_indexer::utils::retry::{ReconnectBackoff, RetryConfig, retry};
use nft_event_indexer::watcher::chain::AlloyNode;
use nft_event_indexer::watcher::run_node;

const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new("nft-event-indexer".to_string())?);
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Shared cache tier
    let shared: Option<Arc<dyn SharedTier>> = match config.cache.redis_url.as_deref() {
        Some(url) => {
            let tier = retry(
                || async { RedisTier::connect(url).await.map_err(anyhow::Error::from) },
                &RetryConfig::default(),
                "connect shared cache tier",
            )
            .await?;
            Some(Arc::new(tier))
        }
        None => {
            warn!("No shared cache tier configured, notification locks are process-local");
            None
        }
    };

    let ctx = AppContext::new(config, shared, metrics.clone());
    info!("Instance id: {}", ctx.instance_id);

    let shutdown = ctx.output.shutdown_sender();
    let shutdown_output = ctx.output.clone();
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            info!("Received Ctrl+C signal, initiating shutdown...");
            shutdown_output.shutdown();
        }
    });

    // Aggregate eviction
    tokio::spawn(run_sweeper(
        ctx.transactions.clone(),
        ctx.config.correlation.sweep_interval(),
        ctx.config.correlation.retention(),
        metrics.clone(),
        shutdown.subscribe(),
    ));

    // Downstream consumers
    tokio::spawn(ctx.stats.clone().run(
        ctx.output.subscribe(),
        Duration::from_secs(ctx.config.stats_interval_secs.max(1)),
        shutdown.subscribe(),
    ));

    if ctx.config.notifications.enabled {
        let gate = Arc::new(NotificationGate::new(ctx.cache.clone(), Arc::new(LogNotifier)));
        tokio::spawn(gate.run(ctx.output.subscribe(), shutdown.subscribe()));
    }

    // Management bus
    let bus: Arc<dyn ManagementBus> = match ctx.config.cache.redis_url.as_deref() {
        Some(url) => Arc::new(RedisBus::connect(url, &ctx.config.stream.mgmt_topic).await?),
        None => Arc::new(LocalBus::new()),
    };

    // Marketplace stream, owned by instances with an api key
    match ctx.config.stream.api_key() {
        Some(api_key) => {
            let (events_tx, events_rx) = mpsc::channel(MAX_CHANNEL_CAPACITY);
            let (socket, connection) =
                PhoenixSocket::new(&ctx.config.stream, api_key, events_tx, metrics.clone())?;
            tokio::spawn(connection.run(shutdown.subscribe()));

            let manager = Arc::new(SubscriptionManager::new(
                Arc::new(socket),
                true,
                Duration::from_millis(ctx.config.stream.subscribe_delay_ms),
            ));
            tokio::spawn(run_manager(
                manager,
                bus.clone(),
                ctx.instance_id.clone(),
                ReconnectBackoff::from(&ctx.config.stream.reconnect),
                shutdown.subscribe(),
            ));

            tokio::spawn(route_events(
                events_rx,
                Arc::new(ctx.offer_handler()),
                shutdown.subscribe(),
            ));
        }
        None => info!("No stream api key set, marketplace stream is disabled"),
    }

    let publisher = SlugPublisher::new(bus, ctx.collections.clone(), ctx.instance_id.clone());
    tokio::spawn(publisher.run(
        ReconnectBackoff::from(&ctx.config.stream.reconnect),
        shutdown.subscribe(),
    ));

    // Chain log sources
    if ctx.config.nodes.is_empty() {
        warn!("No chain nodes configured");
    }

    let pipeline = Arc::new(ctx.pipeline());
    for (index, node_config) in ctx.config.nodes.iter().enumerate() {
        let node = Arc::new(AlloyNode::connect(index as u32 + 1, node_config, metrics.clone()).await?);
        let backoff = ReconnectBackoff::from(&ctx.config.node_reconnect);

        let pipeline = pipeline.clone();
        let workers = ctx.config.workers_per_node;
        let node_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_node(node, pipeline, workers, backoff, node_shutdown).await {
                error!("Log watcher stopped: {}", e);
            }
        });
    }

    println!();
    info!("========================= STARTING INDEXER =========================");

    let mut shutdown_signal = ctx.output.shutdown_signal();
    let _ = shutdown_signal.recv().await;

    // give the loops a moment to log their exit
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Shutdown complete");

    Ok(())
}
