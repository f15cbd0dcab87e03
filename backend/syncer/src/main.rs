//! Campaign Syncer: entry point.
//!
//! Follows the crowdfunding factory and its campaign contracts over Ethereum
//! JSON-RPC and keeps an SQLite mirror of every campaign in step with the
//! chain. Background tasks (log subscriber, event consumer, resync and
//! deadline sweeps) run next to a small Axum REST API; ctrl-c cancels them all
//! and waits for in-flight work to land.

mod abi;
mod api;
mod cache;
mod chain;
mod config;
mod db;
mod engine;
mod errors;
mod events;
mod notify;
mod rpc;
mod scheduler;
mod subscriber;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cache::TtlCache;
use chain::RpcChainReader;
use config::Config;
use engine::ReconciliationEngine;
use notify::{LogNotifier, Notifier, WebhookNotifier};
use rpc::RpcClient;
use scheduler::Scheduler;
use subscriber::{consume, EventSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // One HTTP client for JSON-RPC and webhook calls.
    let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
    let rpc = RpcClient::new(
        client.clone(),
        &config.rpc_url,
        config.rpc_max_attempts,
        config.rpc_backoff(),
    );

    let reader = Arc::new(RpcChainReader::new(
        rpc.clone(),
        config.factory_address,
        config.start_block,
        config.log_page_blocks,
    ));
    let engine = Arc::new(ReconciliationEngine::new(pool.clone(), reader));

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!("Success notifications go to {url}");
            Arc::new(WebhookNotifier::new(client, url.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // ─── Event pipeline ───────────────────────────────────
    let subscriber = EventSubscriber::new(Arc::new(rpc), pool.clone(), config.subscriber());
    let cursor_key = subscriber.cursor_key().to_string();
    let (tx, rx) = mpsc::channel(config.event_queue_capacity.max(1));
    tasks.push(tokio::spawn(subscriber.run(tx, cancel.clone())));
    tasks.push(tokio::spawn(consume(
        engine.clone(),
        rx,
        cursor_key,
        config.rpc_backoff(),
        cancel.clone(),
    )));

    // ─── Sweeps ───────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(engine.clone(), notifier, config.schedule()));
    tasks.push(tokio::spawn(scheduler.clone().run_resync_loop(cancel.clone())));
    tasks.push(tokio::spawn(scheduler.run_deadline_loop(cancel.clone())));

    // ─── REST API ─────────────────────────────────────────
    let stats_cache = TtlCache::new(config.stats_cache_ttl());
    tasks.push(stats_cache.spawn_sweeper(config.stats_cache_ttl(), cancel.clone()));

    let api_state = Arc::new(api::ApiState {
        pool: pool.clone(),
        engine,
        stats_cache,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {e}");
            }
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    // The server can also stop on its own; make sure every task sees it.
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Background task panicked: {e}");
        }
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
