use anyhow::Context;
use clap::Parser;
use nsite_gateway::invalidation::{self, InvalidationConfig};
use nsite_gateway::logging::{init_logging, LogArgs};
use nsite_gateway::{metrics_server, server, App, GatewayConfig};
use relay_client::{PoolConfig, RelayPool};
use site_cache::{CacheConfig, CacheStore};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Gateway serving static sites whose path mappings live on relays and
/// whose files live on content-addressed blob servers.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    /// Base domain whose subdomain labels are publisher npubs.
    #[arg(long, env = "BASE_DOMAIN", default_value = "localhost")]
    base_domain: String,
    /// Port for site traffic.
    #[arg(long, env = "LISTEN_PORT", default_value = "3000")]
    port: u16,
    /// Port for prometheus metrics.
    #[arg(long, env = "METRICS_PORT", default_value = "3001")]
    metrics_port: u16,

    /// Seed relays used to discover per-publisher relay lists.
    #[arg(
        long,
        env = "DEFAULT_RELAYS",
        value_delimiter = ',',
        default_value = "wss://relay.damus.io,wss://nos.lol,wss://relay.nostr.band,wss://purplepag.es"
    )]
    default_relays: Vec<Url>,
    /// Fallback blob servers for publishers without a server list.
    #[arg(
        long,
        env = "DEFAULT_SERVERS",
        value_delimiter = ',',
        default_value = "https://blossom.primal.net,https://cdn.satellite.earth"
    )]
    default_servers: Vec<Url>,

    /// Cache backend: memory, kv://host:port[/db], or file://path.
    #[arg(long, env = "CACHE_BACKEND", default_value = "memory")]
    cache_backend: String,
    /// Default TTL for cached lookups.
    #[arg(long, env = "CACHE_DEFAULT_TTL", value_parser = humantime::parse_duration, default_value = "1h")]
    cache_default_ttl: Duration,
    /// TTL for cached file bytes.
    #[arg(long, env = "CONTENT_CACHE_TTL", value_parser = humantime::parse_duration, default_value = "30m")]
    content_cache_ttl: Duration,
    /// TTL for negative marks on absent lookups.
    #[arg(long, env = "NEGATIVE_CACHE_TTL", value_parser = humantime::parse_duration, default_value = "10s")]
    negative_cache_ttl: Duration,
    /// Refresh TTLs on read for the read-path namespaces.
    #[arg(long, env = "SLIDING_EXPIRATION", action = clap::ArgAction::SetTrue)]
    sliding_expiration: bool,

    /// Ceiling on the wall time of a single relay query.
    #[arg(long, env = "RELAY_QUERY_TIMEOUT", value_parser = humantime::parse_duration, default_value = "5s")]
    relay_query_timeout: Duration,
    /// Close relay connections unused for this long.
    #[arg(long, env = "CONNECTION_IDLE_THRESHOLD", value_parser = humantime::parse_duration, default_value = "1h")]
    connection_idle_threshold: Duration,
    /// How often the relay pool sweeps for idle connections.
    #[arg(long, env = "CLEANUP_INTERVAL", value_parser = humantime::parse_duration, default_value = "5m")]
    cleanup_interval: Duration,

    /// Keep caches warm from live publish events.
    #[arg(long, env = "REALTIME_INVALIDATION", default_value_t = true, action = clap::ArgAction::Set)]
    realtime_invalidation: bool,
    /// Relays the invalidation subscriber listens to; defaults to the
    /// seed relays when empty.
    #[arg(long, env = "INVALIDATION_RELAYS", value_delimiter = ',')]
    invalidation_relays: Vec<Url>,
    /// Backoff before re-opening a dropped invalidation subscription.
    #[arg(long, env = "INVALIDATION_RECONNECT_DELAY", value_parser = humantime::parse_duration, default_value = "5s")]
    invalidation_reconnect_delay: Duration,

    /// Byte cap on fetched files.
    #[arg(long, env = "MAX_FILE_SIZE", default_value = "52428800")]
    max_file_size: u64,
    /// Per-server deadline for one blob fetch.
    #[arg(long, env = "REQUEST_TIMEOUT", value_parser = humantime::parse_duration, default_value = "10s")]
    request_timeout: Duration,
    /// Cache-Control header on served blobs.
    #[arg(long, env = "CACHE_CONTROL", default_value = "public, max-age=3600")]
    cache_control: String,

    #[command(flatten)]
    log_args: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_args);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting nsite-gateway");

    let cache = CacheStore::open(
        &cli.cache_backend,
        CacheConfig {
            default_ttl: cli.cache_default_ttl,
            content_ttl: cli.content_cache_ttl,
            negative_ttl: cli.negative_cache_ttl,
            sliding_expiration: cli.sliding_expiration,
        },
    )
    .await
    .context("failed to open the cache backend")?;

    let pool = RelayPool::new(PoolConfig {
        idle_threshold: cli.connection_idle_threshold,
        cleanup_interval: cli.cleanup_interval,
    });

    let app = Arc::new(App::new(
        cache,
        pool,
        GatewayConfig {
            base_domain: cli.base_domain.to_ascii_lowercase(),
            default_relays: cli.default_relays.clone(),
            default_servers: cli.default_servers,
            relay_query_timeout: cli.relay_query_timeout,
            request_timeout: cli.request_timeout,
            max_file_size: cli.max_file_size,
            cache_control: cli.cache_control,
        },
    )?);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received Ctrl+C, initiating shutdown");
        ctrl_c_token.cancel();
    });

    let metrics_addr: std::net::SocketAddr = format!("[::]:{}", cli.metrics_port).parse()?;
    let metrics_router = metrics_server::build_router();
    tokio::spawn(async move {
        axum::Server::bind(&metrics_addr)
            .serve(metrics_router.into_make_service())
            .await
            .unwrap()
    });

    let invalidation_relays = if cli.invalidation_relays.is_empty() {
        cli.default_relays
    } else {
        cli.invalidation_relays
    };
    let subscriber_token = shutdown.child_token();
    let subscribers = invalidation::spawn(
        app.clone(),
        InvalidationConfig {
            enabled: cli.realtime_invalidation,
            relays: invalidation_relays,
            reconnect_delay: cli.invalidation_reconnect_delay,
        },
        subscriber_token.clone(),
    );

    let addr: std::net::SocketAddr = format!("[::]:{}", cli.port).parse()?;
    tracing::info!(%addr, base_domain = app.config.base_domain, "serving sites");
    let router = server::build_router(app.clone());
    let graceful_token = shutdown.clone();
    let server = axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move { graceful_token.cancelled().await });

    tokio::select! {
        result = server => result.context("gateway server failed")?,
        _ = async { shutdown.cancelled().await; tokio::time::sleep(SHUTDOWN_GRACE).await } => {
            tracing::warn!("grace period elapsed with requests still in flight");
        }
    }

    // Orderly teardown: subscriber first, then the relay pool, then the
    // cache backend. Each step is idempotent.
    subscriber_token.cancel();
    for handle in subscribers {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    app.pool.shutdown().await;
    app.cache.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}
