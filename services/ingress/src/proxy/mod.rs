//! Connection and request handling.
//!
//! ## Architecture
//!
//! ```text
//!                 +-- passthrough ----------------------------> sni:upstreamPort
//! TLS listener ---+
//!   (SNI sniff)   +-- terminate (CertificateStore) --+
//!                                                    |
//! HTTP listener -------------------------------------+--> Pipeline
//!                                                          |
//!            Router -> Service/LoadBalancer -> ConnectionContext -> upstream
//! ```
//!
//! Each inbound connection owns a [`ConnectionContext`]: its sticky targets
//! and upstream connections live and die with it. Request and response
//! bodies stream through a [`TappedBody`](body::TappedBody), which holds the
//! balancer lease until the response body ends.

pub mod balancer;
pub mod body;
pub mod certs;
pub mod forward;
pub mod handshake;
pub mod listener;
pub mod pool;
pub mod router;
pub mod session;
pub mod sni;
pub mod tls;
pub mod trust;

pub use balancer::{LoadBalancer, Service, Strategy, Target};
pub use certs::{CertEntry, CertificateStore};
pub use forward::{ConnectionInfo, Pipeline};
pub use handshake::{PassthroughPolicy, TlsDecision};
pub use listener::{Listener, ListenerConfig, ListenerKind, ListenerStats};
pub use pool::ConnectionPool;
pub use router::{RouteDecision, Router};
pub use session::ConnectionContext;
pub use sni::{SniConfig, SniInspector, SniResult};
pub use trust::IssuingCaPool;
