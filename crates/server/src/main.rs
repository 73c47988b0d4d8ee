use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use gatehouse_gateway::{GatewayBuilder, GatewayConfig};
use gatehouse_metadata::{MemoryMetadataStore, MetadataSeed, MetadataStore};
use gatehouse_server::api::{AppState, router};
use gatehouse_server::auth::TokenPrincipalResolver;
use gatehouse_server::config::ServerConfig;
use gatehouse_server::state_factory::create_state;

/// Gatehouse API gateway HTTP server.
#[derive(Parser, Debug)]
#[command(name = "gatehouse", about = "Standalone HTTP server for the Gatehouse API gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing from RUST_LOG or default to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load configuration from the TOML file, or use defaults when absent.
    let config: ServerConfig = if Path::new(&cli.config).exists() {
        let contents = std::fs::read_to_string(&cli.config)?;
        toml::from_str(&contents)?
    } else {
        info!(path = %cli.config, "config file not found, using defaults");
        toml::from_str("")?
    };

    // State backend for caches, counters, and circuit state.
    let (store, lock) = create_state(&config.state)?;

    // Metadata registry. Standalone mode seeds an in-memory store; a
    // deployment-specific store can replace this behind the same trait.
    let metadata: Arc<dyn MetadataStore> = match config.metadata.seed_path.as_deref() {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("failed to read metadata seed at {path}: {e}"))?;
            let seed = MetadataSeed::from_json(&contents)
                .map_err(|e| format!("failed to parse metadata seed: {e}"))?;
            info!(path, apis = seed.apis.len(), "metadata seed loaded");
            Arc::new(MemoryMetadataStore::from_seed(seed))
        }
        None => {
            warn!("no metadata seed configured, starting with an empty registry");
            Arc::new(MemoryMetadataStore::new())
        }
    };

    // Principal resolution from the configured token table.
    let resolver = Arc::new(TokenPrincipalResolver::new(
        &config.auth.tokens,
        Arc::clone(&metadata),
        Arc::clone(&store),
        Duration::from_secs(config.auth.principal_cache_ttl_seconds),
    ));

    // Pipeline configuration comes from the environment.
    let gateway_config = GatewayConfig::from_env();
    let gateway = Arc::new(
        GatewayBuilder::new()
            .config(gateway_config)
            .state(store)
            .lock(lock)
            .metadata(Arc::clone(&metadata))
            .resolver(resolver.clone())
            .build()?,
    );

    let state = AppState {
        gateway,
        resolver,
        started_at: chrono::Utc::now(),
        state_backend: config.state.backend.clone(),
    };
    let app = router(state);

    let host = cli.host.unwrap_or(config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gatehouse listening");

    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(grace))
    .await?;

    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM. After the grace period the process exits even
/// if in-flight requests are still draining.
async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!(grace_seconds = grace.as_secs(), "shutdown signal received, draining");
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("shutdown grace period elapsed, forcing exit");
        std::process::exit(0);
    });
}
