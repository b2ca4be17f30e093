mod appview;
mod batcher;
mod cache;
mod coalesce;
mod config;
mod cursor;
mod db;
mod error;
mod failed;
mod firehose;
mod handlers;
mod lexicon;
mod limiter;
mod logging;
mod metrics;
mod models;
mod resolver;
mod stream;
mod subscription;
mod text;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::oneshot};
use tracing::{error, info};

use crate::appview::AppViewClient;
use crate::cache::PresenceCache;
use crate::cursor::CursorStore;
use crate::failed::FailedMessageStore;
use crate::firehose::Dispatcher;
use crate::handlers::RecordHandlers;
use crate::limiter::RateLimiter;
use crate::resolver::Resolver;

const PRESENCE_TTL: Duration = Duration::from_secs(24 * 3600);
const PRESENCE_CAPACITY: u64 = 1_000_000;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    // Initialize logging first thing
    logging::setup_logging(cli.verbose);

    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    info!("Starting Bluesky graph indexer");

    // Load configuration
    let config = config::Config::from_env()?;
    if cli.verbose {
        info!(
            relay = %config.relay_url,
            appview = %config.appview_url,
            state_dir = %config.state_dir.display(),
            "Configuration loaded"
        );
    }

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

    // Initialize database connection pool
    let db_pool = db::init_db_pool(&config.database_url).await?;

    // Process-wide singletons: rate limiter, caches, durable state
    let limiter = Arc::new(RateLimiter::new());
    {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.run_refill().await });
    }

    let user_cache = PresenceCache::new(
        PRESENCE_CAPACITY,
        PRESENCE_TTL,
        &metrics::USER_CACHE_HITS,
        &metrics::USER_CACHE_MISSES,
    );
    let post_cache = PresenceCache::new(
        PRESENCE_CAPACITY,
        PRESENCE_TTL,
        &metrics::POST_CACHE_HITS,
        &metrics::POST_CACHE_MISSES,
    );

    let cursor = Arc::new(CursorStore::load(config.cursor_path()).await?);
    {
        let cursor = cursor.clone();
        tokio::spawn(async move { cursor.run_flusher().await });
    }

    let failed = Arc::new(FailedMessageStore::load(config.failed_messages_path()).await?);

    let appview = Arc::new(AppViewClient::new(config.appview_url.clone(), limiter.clone())?);
    let resolver = Arc::new(Resolver::new(
        db_pool.clone(),
        appview,
        user_cache,
        post_cache,
    ));
    let handlers = RecordHandlers::new(db_pool.clone(), resolver);
    let dispatcher = Arc::new(Dispatcher::new(handlers, cursor.clone(), failed));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // Spawn firehose consumer task
    let mut firehose_handle = tokio::spawn(firehose::run_firehose_consumer(
        config.relay_url.clone(),
        dispatcher,
        cursor.clone(),
        shutdown_rx,
    ));

    // Spawn the adaptive throttle
    let throttle_handle = tokio::spawn(firehose::run_adaptive_throttle(
        limiter.clone(),
        cli.verbose,
    ));

    // Run until interrupted or the consumer gives up on the connection
    let mut early_exit = None;
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully");
            let _ = shutdown_tx.send(());
        }
        result = &mut firehose_handle => {
            early_exit = Some(result);
        }
    }
    let consumer_result = match early_exit {
        Some(result) => result,
        None => firehose_handle.await,
    };
    throttle_handle.abort();

    // One last cursor write so the restart resumes where we stopped
    if let Err(e) = cursor.flush().await {
        error!("Final cursor flush failed: {}", e);
    }

    consumer_result.context("firehose consumer panicked")??;

    info!("Shutdown complete");
    Ok(())
}
