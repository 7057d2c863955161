//! plfm-vt UDP proxy
//!
//! Session-based UDP proxy.
//!
//! This service:
//! - Accepts datagrams on a configured listener
//! - Maps each client flow to a session with its own upstream socket
//! - Relays datagrams in both directions
//! - Evicts sessions after an idle timeout

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plfm_udp_proxy::config::Config;
use plfm_udp_proxy::{
    Host, ListenerConfig, StaticClusterManager, TokioTimeSource, UdpListener,
    UdpProxyFilterConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to UDP_PROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plfm-vt udp proxy");
    info!(
        bind_addr = %config.bind_addr,
        cluster = %config.proxy.cluster,
        upstream_count = config.upstreams.len(),
        idle_timeout_ms = config.proxy.idle_timeout_ms,
        max_datagram_size = config.proxy.max_datagram_size,
        max_sessions = config.proxy.max_sessions,
        "Configuration loaded"
    );

    let clusters = Arc::new(StaticClusterManager::new());
    clusters.update_cluster(
        &config.proxy.cluster,
        config
            .upstreams
            .iter()
            .enumerate()
            .map(|(i, addr)| Host::new(*addr, format!("{}-{}", config.proxy.cluster, i)))
            .collect(),
    );

    let filter_config = Arc::new(UdpProxyFilterConfig::new(
        clusters,
        Arc::new(TokioTimeSource),
        config.proxy.clone(),
    ));

    let listener = UdpListener::bind(ListenerConfig::new(config.bind_addr), filter_config)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.bind_addr))?;
    let span = tracing::info_span!("udp_listener", bind_addr = %listener.local_addr());

    listener
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .instrument(span)
        .await?;

    info!("Shutdown complete");
    Ok(())
}
