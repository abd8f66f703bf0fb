mod api;
mod config;
mod db;
mod error;
mod evaluator;
mod market;
mod metadata;
mod pool;
mod queue;
mod scanner;
mod sink;
mod state;
mod token;
mod types;

#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{router, ApiState};
use crate::config::{
    Config, ACTIVITY_LOOKBACK_DAYS, CACHE_SWEEP_INTERVAL_SECS, CHANNEL_CAPACITY, TOKEN_REFRESH_SECS,
};
use crate::db::writer::DbWriter;
use crate::error::Result;
use crate::evaluator::{ArbitrageEvaluator, EvaluatorSettings};
use crate::market::{MarketClient, PortalsClient, TonnelClient};
use crate::metadata::MetadataResolver;
use crate::pool::cdp::Browser;
use crate::pool::proxy::load_proxies;
use crate::pool::solver::{run_solver_task, ChallengeSolver, TwoCaptchaSolver};
use crate::pool::{BrowsedPool, DirectPool};
use crate::queue::work_queue;
use crate::scanner::MarketScanner;
use crate::sink::ChannelSink;
use crate::state::{run_sweeper, DedupCache};
use crate::token::{SharedTokens, TokenProvider};
use crate::types::Signal;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // --- Database setup ---
    let pool = SqlitePoolOptions::new()
        .connect(&format!("sqlite:{}?mode=rwc", cfg.db_path))
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Resource pools ---
    let proxies = load_proxies(&cfg.proxies_path)?;
    let portals_latency = Arc::new(LatencyStats::new());
    let tonnel_latency = Arc::new(LatencyStats::new());

    let portals_pool = Arc::new(DirectPool::from_proxies("portals", &proxies, Arc::clone(&portals_latency))?);

    let browser = match &cfg.chrome_ws_url {
        Some(ws_url) => {
            info!("Attaching to browser at {ws_url}");
            Browser::connect(ws_url).await?
        }
        None => {
            info!("Launching browser {}", cfg.chrome_path);
            Browser::launch(&cfg.chrome_path).await?
        }
    };
    let session_count = cfg.browser_sessions.clamp(1, proxies.len());
    let (tonnel_pool, interceptions) = BrowsedPool::launch(
        "tonnel",
        browser,
        &proxies[..session_count],
        &cfg.tonnel_origin,
        Arc::clone(&tonnel_latency),
    )
    .await?;

    // --- Challenge solving ---
    let solver: Arc<dyn ChallengeSolver> = Arc::new(TwoCaptchaSolver::new(&cfg.solver_api_url, &cfg.solver_api_key)?);
    let (solve_tx, solve_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_solver_task(solver, solve_rx, cancel.clone()));
    tokio::spawn(Arc::clone(&tonnel_pool).run_challenge_loop(interceptions, solve_tx, cancel.clone()));

    // --- Session tokens ---
    let tokens = Arc::new(SharedTokens::new(cfg.tonnel_auth.clone(), cfg.portals_auth.clone()));
    match &cfg.token_file {
        Some(path) => {
            let path = PathBuf::from(path);
            if let Err(e) = tokens.load_file(&path).await {
                warn!(path = %path.display(), "Token file not loaded yet: {e}");
            }
            tokio::spawn(Arc::clone(&tokens).run_file_refresher(
                path,
                Duration::from_secs(TOKEN_REFRESH_SECS),
                cancel.clone(),
            ));
        }
        None if cfg.tonnel_auth.is_none() || cfg.portals_auth.is_none() => {
            warn!("TOKEN_FILE not set and a marketplace token is missing; its requests will wait for one");
        }
        None => {}
    }
    let token_provider: Arc<dyn TokenProvider> = tokens;

    // --- Marketplace clients ---
    let tonnel: Arc<dyn MarketClient> = Arc::new(TonnelClient::new(
        Arc::clone(&tonnel_pool),
        Arc::clone(&token_provider),
        &cfg.tonnel_api_url,
        &cfg.tonnel_origin,
        cfg.scan_page_limit,
    ));
    let portals: Arc<dyn MarketClient> = Arc::new(PortalsClient::new(
        Arc::clone(&portals_pool),
        Arc::clone(&token_provider),
        &cfg.portals_api_url,
        cfg.scan_page_limit,
    ));

    // --- Shared state ---
    let health = Arc::new(HealthState::new());
    let dedup: Arc<DedupCache<String>> = Arc::new(DedupCache::new());
    tokio::spawn(run_sweeper(
        Arc::clone(&dedup),
        Duration::from_secs(CACHE_SWEEP_INTERVAL_SECS),
        cancel.clone(),
    ));

    // --- Channels ---
    let (queue_tx, queue_rx) = work_queue(cfg.queue_capacity);
    let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_CAPACITY);

    // Signal consumer: telemetry logger + DB writer
    let pool_clone = pool.clone();
    let consumer = tokio::spawn(async move {
        signal_consumer(signal_rx, pool_clone).await;
    });

    // --- Scanners ---
    let mut tasks = Vec::new();
    for client in [Arc::clone(&tonnel), Arc::clone(&portals)] {
        let scanner = MarketScanner::new(client, queue_tx.clone(), Arc::clone(&health), cfg.scan_interval);
        tasks.push(tokio::spawn(scanner.run(cancel.clone())));
    }

    // --- Evaluator workers ---
    let metadata = match MetadataResolver::new(&cfg.metadata_base_url) {
        Ok(m) => Some(Arc::new(m)),
        Err(e) => {
            warn!("Metadata resolver unavailable, signals will carry none: {e}");
            None
        }
    };
    let settings = EvaluatorSettings::from_config(&cfg, Duration::from_secs(ACTIVITY_LOOKBACK_DAYS * 24 * 3_600));
    let evaluator = Arc::new(ArbitrageEvaluator::new(
        tonnel,
        portals,
        metadata,
        Arc::new(ChannelSink::new(signal_tx)),
        Arc::clone(&dedup),
        Arc::clone(&health),
        settings,
    ));
    tasks.extend(Arc::clone(&evaluator).spawn_workers(cfg.worker_count, queue_rx, cancel.clone()));
    info!(
        workers = cfg.worker_count,
        tonnel_slots = tonnel_pool.len(),
        portals_slots = portals_pool.len(),
        "Pipeline started"
    );

    // HTTP API server
    let api_state = ApiState {
        pool: pool.clone(),
        health,
        dedup,
        queue: queue_tx,
        tonnel_pool: Arc::clone(&tonnel_pool),
        portals_pool,
        tonnel_latency,
        portals_latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Signal handler failed: {e}"),
        }
        shutdown.cancel();
    });

    let api_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { api_cancel.cancelled().await })
        .await?;

    // --- Shutdown ---
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {e}");
        }
    }
    // The evaluator (and with it the last signal sender) is gone once its workers stop.
    drop(evaluator);
    if let Err(e) = consumer.await {
        warn!("Signal consumer ended abnormally: {e}");
    }
    tonnel_pool.shutdown().await;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

/// Consumes emitted signals: logs to console and forwards to the DB writer.
async fn signal_consumer(mut rx: mpsc::Receiver<Signal>, pool: sqlx::SqlitePool) {
    let db_writer_tx = {
        let (tx, signal_rx) = mpsc::channel::<Signal>(CHANNEL_CAPACITY);
        let writer = DbWriter::new(pool, signal_rx);
        tokio::spawn(async move { writer.run().await });
        tx
    };

    while let Some(signal) = rx.recv().await {
        log_signal(&signal);
        if let Err(e) = db_writer_tx.try_send(signal) {
            warn!("DB writer channel full: {e}");
        }
    }
}

fn log_signal(s: &Signal) {
    let fmt_price = |p: Option<f64>| p.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string());
    let reference = if s.direction.is_cross_market() {
        s.sell_side.floor_price()
    } else {
        s.sell_side.second_floor_price()
    };
    let with_fee = s
        .percent_diff_with_fee
        .map(|f| format!("{f:.2}%"))
        .unwrap_or_else(|| "n/a".to_string());

    info!(
        event = "SIGNAL",
        direction = %s.direction,
        variant = %s.variant,
        dedup_key = %s.dedup_key,
        percent_diff = s.percent_diff,
        activity = %s.sell_side.activity_level,
        "SIGNAL | {} | {} / {} / {} | buy {} @ {} | ref {} @ {} | diff: {:.2}% | with fee: {} | activity: {}",
        s.direction,
        s.collection_name,
        s.model_name,
        s.backdrop_name,
        s.buy_side.marketplace,
        fmt_price(s.buy_side.floor_price()),
        s.sell_side.marketplace,
        fmt_price(reference),
        s.percent_diff,
        with_fee,
        s.sell_side.activity_level,
    );
}
