use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hmux_proxy::proxy::{build_router, AppState};
use hmux_proxy::{load_config, resolve_settings, LoadBalancer, ProxyConfig};

#[derive(Parser, Debug)]
#[command(name = "hmux-proxy", about = "HMUX reverse-proxy connector")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hmux_proxy=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    let settings = Arc::new(resolve_settings(&config).map_err(|errors| {
        for error in &errors {
            tracing::error!(%error, "invalid configuration");
        }
        "configuration validation failed"
    })?);

    tracing::info!(
        bind_address = %config.listener.bind_address,
        backends = settings.servers.len(),
        sticky_sessions = settings.sticky_sessions,
        "configuration loaded"
    );

    let balancer = Arc::new(LoadBalancer::new(settings.clone()));

    let state = AppState {
        balancer,
        settings,
        config: Arc::new(config),
    };

    let listener = TcpListener::bind(&state.config.listener.bind_address).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "listening for connections");

    let router = build_router(state);
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
