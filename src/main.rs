// actrelay - Activity-telemetry relay for an LLM desktop assistant
//
// Boots the full chain: configuration, tracing, template registry,
// authenticated connection layer, event log, cache, scheduler, metrics,
// tool dispatcher, and the HTTP surface. Shutdown drains in reverse
// order and finalizes the active event-log segment with a durability
// barrier.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use actrelay::cache::ContextCache;
use actrelay::cli;
use actrelay::config::Config;
use actrelay::dispatch::{DispatcherConfig, ToolDispatcher};
use actrelay::eventlog::EventLog;
use actrelay::metrics::MetricsCore;
use actrelay::scheduler::TicketScheduler;
use actrelay::server;
use actrelay::tag::TagGenerator;
use actrelay::templates::TemplateRegistry;
use actrelay::warehouse::{
    AuthConnectionLayer, ConnectionLayer, HttpConnectionFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    if cli::handle_cli() {
        return Ok(());
    }

    Config::ensure_config_exists();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Keep the non-blocking writer guard alive for the process lifetime.
    let _log_guard = init_tracing(&config);

    tracing::info!(version = actrelay::config::VERSION, "starting actrelay");

    // Startup validation: entropy probe and registry-wide template checks
    // both fail fast with ConfigError.
    let tags = TagGenerator::new()?;
    let registry = Arc::new(TemplateRegistry::builtin(&config.objects)?);

    let factory = Arc::new(HttpConnectionFactory::new(config.warehouse_url.as_str()));
    let layer = Arc::new(AuthConnectionLayer::new(
        config.accounts.clone(),
        config.vault.clone(),
        config.breaker.clone(),
        config.pool.clone(),
        config.health.clone(),
        factory,
        Arc::clone(&registry),
        tags,
    )?);
    layer.initialize().await?;

    let log = Arc::new(EventLog::open(config.eventlog.clone()).context("event log")?);
    log.start();

    let cache = Arc::new(ContextCache::new(config.cache.clone()));

    let scheduler = Arc::new(TicketScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&layer) as Arc<dyn ConnectionLayer>,
        Arc::clone(&registry),
        tags,
    ));
    scheduler.start();

    let metrics = Arc::new(MetricsCore::new(config.metrics.clone()));
    let rollup = metrics.spawn_rollup();

    let dispatcher = Arc::new(ToolDispatcher::new(
        DispatcherConfig {
            budgets: config.budgets.clone(),
            default_customer: std::env::var("ACTRELAY_CUSTOMER")
                .unwrap_or_else(|_| "local_user".to_string()),
        },
        tags,
        registry,
        Arc::clone(&layer) as Arc<dyn ConnectionLayer>,
        Arc::clone(&log),
        Arc::clone(&cache),
        Arc::clone(&scheduler),
        metrics,
    ));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    server::serve(dispatcher, config.bind_addr, shutdown)
        .await
        .context("tool surface failed")?;

    // Drain: no new tickets, close pools, finalize the active segment.
    scheduler.close();
    layer.close().await;
    rollup.abort();
    cache.close();
    if let Err(e) = log.close() {
        tracing::error!(error = %e, "failed to finalize event log on shutdown");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Stderr logging plus optional daily-rotated JSON file output.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,actrelay=debug"));

    match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "actrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(file_layer)
                .init();
            Some(guard)
        }
        None if config.logging.json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
            None
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
            None
        }
    }
}
