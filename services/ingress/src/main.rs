//! sluice ingress
//!
//! This service:
//! - Loads the gateway document and reloads it when it changes
//! - Serves plain HTTP and TLS listeners
//! - Terminates TLS or passes it through by SNI
//! - Routes and load-balances requests to backend services
//! - Exposes Prometheus metrics and ships access logs

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice_ingress::access_log::{AccessLogger, LogShipping};
use sluice_ingress::config::Config;
use sluice_ingress::{admin, reload};
use sluice_ingress::{Listener, ListenerConfig, ListenerKind, Metrics, Pipeline, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SLUICE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sluice ingress");
    info!(
        config_path = %config.config_path.display(),
        reload_interval_ms = config.reload_interval.as_millis() as u64,
        bind_ip = %config.bind_ip,
        max_connections = config.max_connections,
        instance_name = %config.instance_name,
        "Configuration loaded"
    );

    let initial = reload::load_state(&config.config_path)?;
    let ports = [
        (ListenerKind::Http, initial.http_port),
        (ListenerKind::Tls, initial.tls_port),
    ];
    if ports.iter().all(|(_, port)| port.is_none()) {
        bail!("Neither the http nor the tls listener is enabled");
    }

    let access_log = match LogShipping::resolve(&initial.logger, &config.logger) {
        Some(shipping) => AccessLogger::spawn(shipping),
        None => AccessLogger::disabled(),
    };
    let state = Arc::new(SharedState::new(initial));
    let metrics = Arc::new(Metrics::new());
    let pipeline = Arc::new(
        Pipeline::new(Arc::clone(&state), Arc::clone(&metrics), access_log)
            .with_instance_name(config.instance_name.clone()),
    );

    for (kind, port) in ports {
        let Some(port) = port else {
            continue;
        };
        let mut listener_config = ListenerConfig::new(kind, SocketAddr::new(config.bind_ip, port));
        listener_config.max_connections = config.max_connections;

        let listener = Listener::bind(listener_config, Arc::clone(&pipeline))
            .await
            .with_context(|| format!("Failed to bind {kind:?} listener on port {port}"))?;
        let listener = Arc::new(listener);
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Listener error");
            }
        });
    }

    if let Some(addr) = config.metrics_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint on {addr}"))?;
        tokio::spawn(admin::serve_metrics(listener, Arc::clone(&metrics)));
    }

    tokio::select! {
        _ = reload::run_reload_loop(&config.config_path, Arc::clone(&state), config.reload_interval) => {
            warn!("Reload loop exited");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
