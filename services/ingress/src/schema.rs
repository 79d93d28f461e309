//! Gateway configuration document.
//!
//! These types mirror the JSON document that describes listeners,
//! certificates, routes, services and access logging. They are deserialized
//! as-is and compiled into a [`GatewayState`](crate::state::GatewayState);
//! nothing in this module is touched on the request path.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default plain HTTP port when `http.listen` is not set.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Default TLS port when `tls.listen` is not set.
pub const DEFAULT_TLS_PORT: u16 = 8443;

/// Default port dialed for passthrough connections.
pub const DEFAULT_PASSTHROUGH_PORT: u16 = 443;

/// Root of the gateway configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDocument {
    #[serde(default)]
    pub http: HttpListenerSpec,
    #[serde(default)]
    pub tls: TlsListenerSpec,
    #[serde(default)]
    pub ssl_passthrough: PassthroughSpec,
    /// Ingress-level trusted CAs (PEM).
    #[serde(default, rename = "trustedCAs")]
    pub trusted_cas: Vec<String>,
    /// Certificates keyed by host pattern, in declaration order.
    #[serde(default)]
    pub certificates: OrderedMap<CertificateHostSpec>,
    /// Routes keyed by `host/path`, in declaration order.
    #[serde(default)]
    pub routes: OrderedMap<RouteSpec>,
    #[serde(default)]
    pub services: HashMap<String, ServiceSpec>,
    #[serde(default)]
    pub logger: LoggerSpec,
}

impl GatewayDocument {
    /// Parse a document from raw JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Read and parse a document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&bytes)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpListenerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen: Option<u16>,
}

impl HttpListenerSpec {
    pub fn port(&self) -> Option<u16> {
        self.enabled
            .then(|| self.listen.unwrap_or(DEFAULT_HTTP_PORT))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsListenerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub listen: Option<u16>,
    /// Require client certificates signed by the issuing CA pool.
    #[serde(default, rename = "mTLS")]
    pub mtls: bool,
    /// Ingress-level default certificate.
    #[serde(default)]
    pub certificate: Option<CertificateSpec>,
}

impl TlsListenerSpec {
    pub fn port(&self) -> Option<u16> {
        self.enabled.then(|| self.listen.unwrap_or(DEFAULT_TLS_PORT))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_passthrough_port")]
    pub upstream_port: u16,
    /// Hostnames eligible for passthrough. Empty means every hostname.
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Default for PassthroughSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            upstream_port: DEFAULT_PASSTHROUGH_PORT,
            hosts: Vec::new(),
        }
    }
}

fn default_passthrough_port() -> u16 {
    DEFAULT_PASSTHROUGH_PORT
}

/// PEM-encoded certificate material. Empty strings mean "not provided".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificateSpec {
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub ca: String,
}

impl CertificateSpec {
    pub fn has_key_pair(&self) -> bool {
        !self.cert.trim().is_empty() && !self.key.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertificateHostSpec {
    #[serde(default, rename = "isTLS")]
    pub is_tls: bool,
    #[serde(default, rename = "isWildcardHost")]
    pub is_wildcard_host: bool,
    #[serde(default, rename = "verifyClient")]
    pub verify_client: bool,
    #[serde(default, rename = "verifyDepth")]
    pub verify_depth: Option<u32>,
    #[serde(default)]
    pub certificate: Option<CertificateSpec>,
    #[serde(default, rename = "trustedCA")]
    pub trusted_ca: Option<CertificateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub ingress_id: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub service_id: String,
    /// `[from_regex, to]`.
    #[serde(default)]
    pub rewrite: Option<Vec<String>>,
    #[serde(default)]
    pub matches: Vec<MatchSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Header,
    Path,
    Method,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchSpec {
    #[serde(rename = "type")]
    pub kind: MatchKind,
    #[serde(default)]
    pub name: Option<String>,
    pub reg: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum BalancerKind {
    #[default]
    #[serde(rename = "round-robin", alias = "RoundRobinLoadBalancer")]
    RoundRobin,
    #[serde(rename = "least-work", alias = "LeastWorkLoadBalancer")]
    LeastWork,
    #[serde(rename = "hashing", alias = "HashingLoadBalancer")]
    Hashing,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub balancer: BalancerKind,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub upstream: Option<UpstreamSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSpec {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSpec {
    #[serde(default)]
    pub ssl_name: Option<String>,
    #[serde(default)]
    pub ssl_verify: bool,
    #[serde(default)]
    pub ssl_cert: Option<CertificateSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "logURL")]
    pub log_url: Option<String>,
    #[serde(default, alias = "Authorization")]
    pub authorization: Option<String>,
}

/// A JSON object deserialized into a vector of entries, keeping the
/// order in which keys appear in the document.
#[derive(Debug, Clone)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}
