use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use axum::{Router, routing::get};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;

pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub instance: String,

    // Log ingestion metrics
    pub logs_received: Counter<u64>,
    pub logs_discarded: Counter<u64>,
    pub tracked_aggregates: Gauge<u64>,

    // Classification metrics
    pub events_emitted: Counter<u64>,
    pub offers: Counter<u64>,

    // RPC metrics
    pub rpc_requests: Counter<u64>,
    pub rpc_errors: Counter<u64>,
    pub rpc_latency: Histogram<f64>,

    // Stream metrics
    pub stream_reconnects: Counter<u64>,

    // Output channel metrics
    pub channel_capacity: Gauge<u64>,
}

impl Metrics {
    pub fn new(instance: String) -> Result<Self, MetricError> {
        // Create a new prometheus registry
        let registry = prometheus::Registry::new();

        // Configure OpenTelemetry to use this registry
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("nft_event_indexer_metrics");

        let logs_received = meter
            .u64_counter("nft_indexer_logs_received")
            .with_description("Number of raw transfer logs received from chain nodes")
            .build();

        let logs_discarded = meter
            .u64_counter("nft_indexer_logs_discarded")
            .with_description("Number of raw logs dropped before classification")
            .build();

        let tracked_aggregates = meter
            .u64_gauge("nft_indexer_tracked_aggregates")
            .with_description("Number of transaction aggregates held in memory")
            .build();

        let events_emitted = meter
            .u64_counter("nft_indexer_events_emitted")
            .with_description("Number of logical events emitted to the output channel")
            .build();

        let offers = meter
            .u64_counter("nft_indexer_collection_offers")
            .with_description("Number of collection offers seen by the offer tracker")
            .build();

        let rpc_requests = meter
            .u64_counter("nft_indexer_rpc_requests")
            .with_description("Number of RPC requests made")
            .build();

        let rpc_errors = meter
            .u64_counter("nft_indexer_rpc_errors")
            .with_description("Number of RPC errors encountered")
            .build();

        let rpc_latency = meter
            .f64_histogram("nft_indexer_rpc_latency")
            .with_description("RPC request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0,
            ])
            .with_unit("s")
            .build();

        let stream_reconnects = meter
            .u64_counter("nft_indexer_stream_reconnects")
            .with_description("Number of reconnects to the marketplace feed")
            .build();

        let channel_capacity = meter
            .u64_gauge("nft_indexer_channel_capacity")
            .with_description("Available capacity of the output channel")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            instance,
            logs_received,
            logs_discarded,
            tracked_aggregates,
            events_emitted,
            offers,
            rpc_requests,
            rpc_errors,
            rpc_latency,
            stream_reconnects,
            channel_capacity,
        })
    }

    pub fn record_rpc(&self, node: &str, method: &'static str, seconds: f64, failed: bool) {
        let labels = [
            KeyValue::new("instance", self.instance.clone()),
            KeyValue::new("node", node.to_string()),
            KeyValue::new("method", method),
        ];

        self.rpc_requests.add(1, &labels);
        self.rpc_latency.record(seconds, &labels);
        if failed {
            self.rpc_errors.add(1, &labels);
        }
    }

    pub fn record_discarded(&self, reason: &'static str) {
        self.logs_discarded.add(
            1,
            &[
                KeyValue::new("instance", self.instance.clone()),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}")
            .parse::<SocketAddr>()
            .context("invalid metrics address")?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Only used for logging
        let access_url = if addr.ip().to_string() == "0.0.0.0" {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind metrics server")?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server stopped: {}", e);
            }
        });

        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
