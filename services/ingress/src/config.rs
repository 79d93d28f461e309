//! Process configuration.
//!
//! Everything here comes from the environment. The gateway document itself
//! (listeners, certificates, routes, services) lives in the file named by
//! `SLUICE_CONFIG` and is described in [`crate::schema`].

use std::{net::IpAddr, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::access_log::LoggerOverrides;

/// Default gateway document location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sluice/config.json";

/// Ingress configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway document path.
    pub config_path: PathBuf,

    /// How often the gateway document is checked for changes.
    pub reload_interval: Duration,

    /// Address the HTTP and TLS listeners bind to.
    pub bind_ip: IpAddr,

    /// Max concurrent connections per listener.
    pub max_connections: usize,

    /// Prometheus scrape endpoint; `None` disables it.
    pub metrics_addr: Option<SocketAddr>,

    /// Name reported in access log events.
    pub instance_name: String,

    /// Access log settings that take precedence over the document.
    pub logger: LoggerOverrides,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let reload_interval_ms: u64 = std::env::var("SLUICE_RELOAD_INTERVAL_MS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SLUICE_RELOAD_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let reload_interval = Duration::from_millis(reload_interval_ms.max(100));

        let bind_ip: IpAddr = std::env::var("SLUICE_BIND_ADDR")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SLUICE_BIND_ADDR must be an IP address.")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let max_connections: usize = std::env::var("SLUICE_MAX_CONNECTIONS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("SLUICE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(10_000)
            .max(1);

        let metrics_addr: Option<SocketAddr> = std::env::var("SLUICE_METRICS_ADDR")
            .ok()
            .filter(|v| !v.is_empty())
            .map(|v| v.parse())
            .transpose()
            .context("SLUICE_METRICS_ADDR must be a socket address (example: 0.0.0.0:9090).")?;

        let instance_name = std::env::var("SLUICE_INSTANCE_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_default();

        let logger = LoggerOverrides {
            enabled: std::env::var("ENABLE_LOG")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            url: std::env::var("LOGURL").ok().filter(|v| !v.is_empty()),
            authorization: std::env::var("LOG_AUTHORIZATION")
                .ok()
                .filter(|v| !v.is_empty()),
        };

        let log_level = std::env::var("SLUICE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            config_path,
            reload_interval,
            bind_ip,
            max_connections,
            metrics_addr,
            instance_name,
            logger,
            log_level,
        })
    }
}
