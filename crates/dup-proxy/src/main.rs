//! dup-proxy: transparent proxy that duplicates live HTTP traffic to shadow
//! destinations per configured rules while forwarding to the primary
//! upstream unchanged.

mod config;
mod mode;
mod proxy;
mod server;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use config::{build_rule_store, AppConfig};
use mode::{DuplicationMode, RuntimeMode};
use server::AppState;

use dup_engine::stats::register_default_providers;
use dup_engine::{Classifier, DispatchPool, DispatchStats, OutboundClient, RequestRunner, StatsRegistry};

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        // Check for --config flag first
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            // Fall back to positional arg
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("DUP_PROXY_CONFIG").ok())
            .unwrap_or_else(|| "dup-proxy.toml".to_string())
    };

    // Load configuration
    let config = AppConfig::load(&config_path)?;

    // Build the tokio runtime first — the OTLP exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional — falls back to fmt-only)
        let _tracing_guard = dup_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            upstream_base = %config.primary.upstream_base_url,
            locations = config.locations.len(),
            "Starting dup-proxy"
        );

        run(config).await
    })
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    // Build the rule store from the location blocks; invalid directives have
    // already been rejected individually.
    let (store, rejected) = build_rule_store(&config);
    if rejected > 0 {
        tracing::warn!(rejected, "some duplication directives were rejected");
    }
    let store = Arc::new(store);

    // Primary HTTP client
    let primary_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.primary.timeout_secs))
        .build()?;

    // Outbound duplicate client (separate client with its own timeout)
    let duplicate_client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.duplication.timeout_ms))
        .build()?;

    // Engine services: stats, outbound client, dispatch pool, classifier
    let stats = DispatchStats::new();
    let registry = StatsRegistry::new();
    register_default_providers(&registry, &stats);

    let outbound = OutboundClient::new(
        duplicate_client,
        Duration::from_millis(config.duplication.timeout_ms),
        stats.clone(),
    );

    let pool = DispatchPool::new(
        Arc::new(RequestRunner::new(outbound.clone())),
        stats.clone(),
        registry.clone(),
    );
    pool.set_program_name(&config.duplication.program_name)?;
    pool.set_threads(config.duplication.min_workers, config.duplication.max_workers)?;
    pool.set_queue(config.duplication.min_queue, config.duplication.max_queue)?;
    pool.set_periods(
        Duration::from_secs(10),
        Duration::from_secs(config.duplication.stats_period_secs),
    )?;
    pool.start();

    let classifier = Classifier::new(store, config.duplication.url_codec);

    let synchronous_paths: HashSet<String> = config
        .locations
        .iter()
        .filter(|l| l.active && l.synchronous)
        .map(|l| l.path.clone())
        .collect();

    let state = AppState {
        config,
        primary_client,
        classifier,
        pool,
        outbound,
        stats,
        registry,
        mode: RuntimeMode::new(DuplicationMode::Duplicate),
        synchronous_paths,
    };

    server::run(state).await
}
