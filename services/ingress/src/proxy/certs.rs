//! Certificate selection by SNI.
//!
//! Lookup order is exact host, then wildcard patterns in declaration order,
//! then the ingress default certificate. Every entry carries a prebuilt
//! `ServerConfig`, so the accept path only clones an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use rustls::ServerConfig;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::proxy::router::normalize_host;
use crate::proxy::tls::{server_config, ClientAuth, KeyPair};
use crate::proxy::trust::IssuingCaPool;
use crate::schema::{CertificateHostSpec, OrderedMap, TlsListenerSpec};

/// Default client verification depth.
pub const DEFAULT_VERIFY_DEPTH: u32 = 1;

/// Convert a host glob into an anchored, case-insensitive regex.
///
/// Regex metacharacters in the glob are escaped first, so only `*` (any run)
/// and `?` (one character) are special.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(glob)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("(?i)^{escaped}$"))
}

/// A certificate bound to a host pattern.
#[derive(Debug)]
pub struct CertEntry {
    pub host_pattern: String,
    pub is_wildcard: bool,
    pub is_tls: bool,
    pub verify_client: bool,
    pub verify_depth: u32,
    /// Whether the prebuilt config demands a client certificate.
    pub requires_client_cert: bool,
    pub server_config: Arc<ServerConfig>,
    pattern: Option<Regex>,
}

impl CertEntry {
    fn matches(&self, host: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(host),
            None => self.host_pattern == host,
        }
    }
}

/// Hosts that must only be reached over TLS.
#[derive(Debug, Default)]
struct TlsDomains {
    exact: HashSet<String>,
    wildcards: Vec<Regex>,
}

impl TlsDomains {
    fn contains(&self, host: &str) -> bool {
        self.exact.contains(host) || self.wildcards.iter().any(|re| re.is_match(host))
    }
}

#[derive(Debug, Default)]
pub struct CertificateStore {
    exact: HashMap<String, Arc<CertEntry>>,
    wildcards: Vec<Arc<CertEntry>>,
    default: Option<Arc<CertEntry>>,
    tls_domains: TlsDomains,
}

impl CertificateStore {
    /// Compile the certificate section. `pool` must already hold every CA
    /// of the document.
    pub fn build(
        tls: &TlsListenerSpec,
        certificates: &OrderedMap<CertificateHostSpec>,
        pool: &IssuingCaPool,
    ) -> Result<Self, ConfigError> {
        let mut store = Self::default();
        let default_spec = tls.certificate.as_ref().filter(|c| c.has_key_pair());

        if let Some(spec) = default_spec {
            let pair = KeyPair::from_pem(&spec.cert, &spec.key).map_err(|reason| {
                ConfigError::InvalidCertificate {
                    host: "<default>".to_string(),
                    reason,
                }
            })?;
            let entry = build_entry(
                String::new(),
                &CertificateHostSpec::default(),
                tls.mtls,
                &pair,
                pool,
                None,
            )?;
            store.default = Some(Arc::new(entry));
        }

        for (host, spec) in certificates.iter() {
            let host = normalize_host(host);
            let is_wildcard = spec.is_wildcard_host || host.contains('*') || host.contains('?');
            let pattern = if is_wildcard {
                Some(glob_to_regex(&host).map_err(|e| ConfigError::InvalidCertificate {
                    host: host.clone(),
                    reason: e.to_string(),
                })?)
            } else {
                None
            };

            if spec.is_tls {
                match &pattern {
                    Some(re) => store.tls_domains.wildcards.push(re.clone()),
                    None => {
                        store.tls_domains.exact.insert(host.clone());
                    }
                }
            }

            // Entries without their own key pair borrow the ingress default.
            let material = spec
                .certificate
                .as_ref()
                .filter(|c| c.has_key_pair())
                .or(default_spec);
            let Some(material) = material else {
                warn!(host = %host, "Certificate entry has no key pair and no default; skipping");
                continue;
            };
            let pair = KeyPair::from_pem(&material.cert, &material.key).map_err(|reason| {
                ConfigError::InvalidCertificate {
                    host: host.clone(),
                    reason,
                }
            })?;

            let entry = Arc::new(build_entry(host.clone(), spec, tls.mtls, &pair, pool, pattern)?);
            if entry.is_wildcard {
                store.wildcards.push(entry);
            } else {
                store.exact.insert(host, entry);
            }
        }

        debug!(
            exact = store.exact.len(),
            wildcard = store.wildcards.len(),
            has_default = store.default.is_some(),
            "Certificate store built"
        );
        Ok(store)
    }

    /// Pick the certificate entry for a ClientHello's SNI.
    pub fn resolve(&self, sni: Option<&str>) -> Option<&Arc<CertEntry>> {
        let host = sni.map(normalize_host).filter(|h| !h.is_empty());
        if let Some(host) = host {
            if let Some(entry) = self.exact.get(&host) {
                return Some(entry);
            }
            if let Some(entry) = self.wildcards.iter().find(|e| e.matches(&host)) {
                return Some(entry);
            }
        }
        self.default.as_ref()
    }

    /// Whether `host` is declared TLS-only.
    pub fn is_tls_host(&self, host: &str) -> bool {
        self.tls_domains.contains(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_entry(
    host_pattern: String,
    spec: &CertificateHostSpec,
    mtls: bool,
    pair: &KeyPair,
    pool: &IssuingCaPool,
    pattern: Option<Regex>,
) -> Result<CertEntry, ConfigError> {
    let verify_depth = spec.verify_depth.unwrap_or(DEFAULT_VERIFY_DEPTH);
    let wants_client_cert = mtls || spec.verify_client;
    if wants_client_cert && pool.is_empty() {
        warn!(host = %host_pattern, "Client verification requested but no CA is trusted; not enforced");
    }
    let client_auth = (wants_client_cert && !pool.is_empty()).then_some(ClientAuth { verify_depth });

    let config = server_config(pair, client_auth, pool)?;
    Ok(CertEntry {
        is_wildcard: pattern.is_some(),
        host_pattern,
        is_tls: spec.is_tls,
        verify_client: spec.verify_client,
        verify_depth,
        requires_client_cert: client_auth.is_some(),
        server_config: Arc::new(config),
        pattern,
    })
}
