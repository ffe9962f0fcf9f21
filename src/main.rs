//! Plex DLNA Bridge entry point.
//!
//! Discovers UPnP renderers via SSDP, bridges each one behind a Plex
//! remote-player HTTP surface, and serves that surface on a single shared
//! listener.

use std::net::SocketAddr;
use std::sync::Arc;

use plex_dlna_bridge::config;
use plex_dlna_bridge::registry::Registry;
use plex_dlna_bridge::ssdp::SsdpDiscoverer;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("plex-dlna-bridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("plex-dlna-bridge {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Bridges UPnP/DLNA renderers onto the LAN as native Plex player devices.");
        println!();
        println!("USAGE:");
        println!("    plex-dlna-bridge [OPTIONS]");
        println!();
        println!("OPTIONS:");
        println!("    -h, --help       Print help information");
        println!("    -V, --version    Print version information");
        println!();
        println!("ENVIRONMENT VARIABLES:");
        println!("    RUST_LOG              Log filter (default: plex_dlna_bridge=info)");
        println!("    BRIDGE__HTTP_PORT     HTTP server port (default: 32488)");
        println!("    BRIDGE__HOST_IP       Advertised host IP (default: guessed from requests)");
        println!("    BRIDGE__LOCATION_URL  Skip SSDP discovery, bridge a single known device");
        return Ok(());
    }

    run().await
}

async fn run() -> anyhow::Result<()> {
    let log_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "plex_dlna_bridge=info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting plex-dlna-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config()?;
    tracing::info!("configuration loaded, http_port: {}", config.http_port);

    let http = reqwest::Client::builder().build()?;
    let registry = Registry::new(http, config.clone());

    let (discoverer, new_device_rx) = SsdpDiscoverer::new(config.location_url.clone());
    let discovery_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        discovery_registry.run_discovery(discoverer, new_device_rx).await;
    });

    let subscribe_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        subscribe_registry.run_subscribe_loop().await;
    });

    let router = plex_dlna_bridge::http::router(Arc::clone(&registry));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("received SIGTERM, shutting down..."),
    }
}
