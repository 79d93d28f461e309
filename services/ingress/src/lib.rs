//! sluice ingress gateway.
//!
//! TLS termination and passthrough chosen per connection by SNI, HTTP routing
//! by host, path, header and method, per-service load balancing with sticky
//! sessions, pooled upstream connections (optionally re-encrypted), request
//! metrics and shipped access logs.

pub mod access_log;
pub mod admin;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod reload;
pub mod schema;
pub mod state;

pub use error::{ConfigError, ForwardError};
pub use metrics::Metrics;
pub use proxy::{Listener, ListenerConfig, ListenerKind, Pipeline};
pub use schema::GatewayDocument;
pub use state::{GatewayState, SharedState};
