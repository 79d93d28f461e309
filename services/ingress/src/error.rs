//! Error types for configuration compilation and request forwarding.

use thiserror::Error;

/// Errors raised while loading or compiling a gateway document.
///
/// A failed load never replaces the running state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid gateway document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("route '{route}': invalid regex '{pattern}': {source}")]
    InvalidRegex {
        route: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("route '{route}': rewrite must be [from, to], got {len} elements")]
    InvalidRewrite { route: String, len: usize },

    #[error("route '{route}': header match requires a name")]
    MissingHeaderName { route: String },

    #[error("certificate '{host}': {reason}")]
    InvalidCertificate { host: String, reason: String },

    #[error("invalid CA certificate: {0}")]
    InvalidCa(String),

    #[error("service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Errors raised while forwarding a single request upstream.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("TLS handshake with {target} failed: {source}")]
    UpstreamTls {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid upstream server name '{0}'")]
    ServerName(String),

    #[error("upstream HTTP error: {0}")]
    Http(#[from] hyper::Error),
}
