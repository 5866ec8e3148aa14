// Tollbooth - withering-token reverse proxy for OpenAI-compatible LLM APIs
//
// Architecture:
// - Proxy server (axum): middleware chain + reverse proxy core
// - Token subsystem: store-backed validation with an LRU hot-path cache
// - Rate limiter: shared-log fixed windows with in-memory fallback
// - HTTP cache: per-project response cache with streaming capture
// - Event pipeline: bus -> dispatcher -> sinks (file, HTTP backends)
// - Stats aggregator: coalesced usage counters flushed to the store

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tollbooth::auth::{ActiveProjectCache, TokenCache};
use tollbooth::cache::HttpCache;
use tollbooth::config::{Config, StoreDriver, VERSION};
use tollbooth::dispatcher::{Dispatcher, EventSink, FileSink, HttpSink};
use tollbooth::proxy::{self, ProxyState};
use tollbooth::stats::StatsAggregator;
use tollbooth::store::{MemoryStore, SqliteStore, TokenStore};
use tollbooth::{bus, ratelimit};

#[derive(Debug, Parser)]
#[command(name = "tollbooth", version = VERSION, about = "Withering-token reverse proxy")]
struct Args {
    /// Config file path (default: ~/.config/tollbooth/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("tollbooth={}", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Keep the file-appender guard alive for the process lifetime
    let _log_guard = init_tracing(&config, filter)?;

    tracing::info!(version = VERSION, "Starting tollbooth");

    // 1. Open the store and verify it answers
    let store: Arc<dyn TokenStore> = match config.store.driver {
        StoreDriver::Sqlite => Arc::new(
            SqliteStore::open(&config.store.path)
                .with_context(|| format!("opening store {}", config.store.path.display()))?,
        ),
        StoreDriver::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    store.ping().await.context("store health check failed")?;

    // 2. Shared key-value log, when configured
    let redis_conn = match &config.redis_url {
        Some(url) => match connect_redis(url).await {
            Ok(conn) => {
                tracing::info!("Shared log connected");
                Some(conn)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Shared log unreachable at startup; components fall back");
                None
            }
        },
        None => None,
    };

    // 3. Process-wide singletons
    let token_cache = Arc::new(TokenCache::new(
        config.token_cache.capacity,
        config.token_cache.ttl,
    ));
    let project_cache = Arc::new(ActiveProjectCache::new(
        config.project_cache.capacity,
        config.project_cache.ttl,
    ));
    let rate_limiter = ratelimit::build(&config.rate_limit, redis_conn.clone());
    let event_bus = bus::build(&config.bus, redis_conn.clone());
    let stats = Arc::new(StatsAggregator::new(
        store.clone(),
        config.dispatcher.batch_size,
        config.dispatcher.flush_interval,
        config.bus.buffer_size,
    ));

    // 4. Dispatcher with its sinks
    let client = proxy::build_client(&config)?;
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(path) = &config.dispatcher.file_sink_path {
        sinks.push(Arc::new(FileSink::new(path.clone())));
    }
    for sink_config in &config.dispatcher.http_sinks {
        sinks.push(Arc::new(HttpSink::new(client.clone(), sink_config.clone())));
    }
    let dispatcher = Arc::new(
        Dispatcher::start(config.dispatcher.clone(), sinks, event_bus.as_ref()).await,
    );

    // 5. HTTP response cache
    let cache_backend = HttpCache::build_backend(&config.cache, redis_conn);
    let http_cache = Arc::new(HttpCache::new(config.cache.clone(), cache_backend));

    // 6. Wire the pipeline into the listener
    let allowlist = Arc::new(config.load_allowlist()?);
    tracing::info!(rules = allowlist.len(), "Allowlist loaded");

    let config = Arc::new(config);
    let state = ProxyState {
        client,
        config: config.clone(),
        allowlist,
        store: store.clone(),
        token_cache,
        project_cache,
        rate_limiter,
        http_cache,
        stats: stats.clone(),
        bus: event_bus.clone(),
        dispatcher: dispatcher.clone(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let proxy_handle = tokio::spawn(async move {
        if let Err(err) = proxy::start_proxy(state, shutdown_rx).await {
            tracing::error!(error = %err, "Proxy server failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    // Reverse order: stop accepting, drain requests, flush counters, drain
    // the dispatcher, then close the bus
    let _ = shutdown_tx.send(());
    let _ = proxy_handle.await;

    stats.shutdown(config.dispatcher.drain_timeout).await;
    dispatcher.shutdown().await;
    event_bus.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn connect_redis(url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(url).context("invalid redis url")?;
    client
        .get_connection_manager()
        .await
        .context("connecting to redis")
}

fn init_tracing(
    config: &Config,
    filter: EnvFilter,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    match &config.logging.file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "tollbooth.log".to_string());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.logging.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
            Ok(Some(guard))
        }
        None => {
            if config.logging.json {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer().json())
                    .init();
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
            }
            Ok(None)
        }
    }
}
