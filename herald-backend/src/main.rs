use anyhow::Context;
use herald_backend::authority::{MojangAuthority, NameAuthority};
use herald_backend::config::Config;
use herald_backend::helpers::SystemClock;
use herald_backend::host::StandaloneHost;
use herald_backend::{Herald, RateLimitConfig, create_app};
use herald_store::MemoryStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging; RUST_LOG overrides
    #[cfg(debug_assertions)]
    let log_level = "debug";
    #[cfg(not(debug_assertions))]
    let log_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting Herald presence service...");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        "Configuration: proxy_id={}, port={}, body_limit={}KB, timeout={}s, servers={:?}",
        config.presence.proxy_id,
        config.port,
        config.request_body_limit / 1024,
        config.request_timeout.as_secs(),
        config.servers
    );
    tracing::info!(
        "Rate limits: events={}/sec (burst {}), general={}/sec (burst {})",
        config.rate_limit_events_per_sec,
        config.rate_limit_events_burst,
        config.rate_limit_general_per_sec,
        config.rate_limit_general_burst
    );

    let authority: Option<Arc<dyn NameAuthority>> = if config.presence.expensive_lookups {
        Some(Arc::new(MojangAuthority::new(&config.presence)?))
    } else {
        None
    };

    // The in-process store is private to this process: no other proxy sees
    // its heartbeats, players or channels. A networked store plugs in
    // behind the same `Store` trait.
    tracing::warn!(
        "Running as a single-node deployment on an in-process store; \
         presence is not shared with any other proxy"
    );
    let herald = Herald::start(
        config.presence.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        Arc::new(StandaloneHost::new(config.servers.clone())),
        authority,
    )
    .await
    .context("failed to join the fleet")?;

    let rate_limit = RateLimitConfig {
        events_per_sec: config.rate_limit_events_per_sec,
        events_burst: config.rate_limit_events_burst,
        general_per_sec: config.rate_limit_general_per_sec,
        general_burst: config.rate_limit_general_burst,
    };
    let app = create_app(
        herald.clone(),
        config.api_token_hash.clone(),
        config.request_body_limit,
        config.request_timeout,
        rate_limit,
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await;

    herald.shutdown().await;
    served.context("server error")
}
