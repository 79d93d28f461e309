//! Compiled gateway state.
//!
//! A [`GatewayState`] is built from one [`GatewayDocument`] and never
//! mutated afterwards. Reloads compile a fresh state and publish it through
//! [`SharedState`]; connections keep the snapshot they started with.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::ConfigError;
use crate::proxy::balancer::{LoadBalancer, Service, Target};
use crate::proxy::certs::CertificateStore;
use crate::proxy::handshake::PassthroughPolicy;
use crate::proxy::router::Router;
use crate::proxy::tls::UpstreamTls;
use crate::proxy::trust::IssuingCaPool;
use crate::schema::{GatewayDocument, LoggerSpec};

#[derive(Debug, Default)]
pub struct GatewayState {
    pub passthrough: PassthroughPolicy,
    pub certificates: CertificateStore,
    pub issuing_cas: IssuingCaPool,
    pub router: Router,
    pub services: HashMap<String, Arc<Service>>,
    pub http_port: Option<u16>,
    pub tls_port: Option<u16>,
    pub logger: LoggerSpec,
}

impl GatewayState {
    /// Compile a document. Any invalid regex, PEM blob or upstream setting
    /// fails the whole compilation.
    pub fn compile(doc: &GatewayDocument) -> Result<Self, ConfigError> {
        let issuing_cas = collect_cas(doc)?;
        let certificates = CertificateStore::build(&doc.tls, &doc.certificates, &issuing_cas)?;
        let router = Router::compile(&doc.routes)?;

        let mut services = HashMap::with_capacity(doc.services.len());
        for (name, spec) in &doc.services {
            let targets = spec
                .targets
                .iter()
                .map(|t| Target::new(t.ip.clone(), t.port))
                .collect();
            let upstream = spec
                .upstream
                .as_ref()
                .map(|u| UpstreamTls::build(name, u, &issuing_cas))
                .transpose()?;

            services.insert(
                name.clone(),
                Arc::new(Service {
                    name: name.clone(),
                    balancer: Arc::new(LoadBalancer::new(spec.balancer.into(), targets)),
                    sticky: spec.sticky,
                    upstream,
                }),
            );
        }

        let state = Self {
            passthrough: PassthroughPolicy::from_spec(&doc.ssl_passthrough),
            certificates,
            issuing_cas,
            router,
            services,
            http_port: doc.http.port(),
            tls_port: doc.tls.port(),
            logger: doc.logger.clone(),
        };

        info!(
            routes = state.router.len(),
            services = state.services.len(),
            certificates = state.certificates.len(),
            trusted_cas = state.issuing_cas.len(),
            passthrough = state.passthrough.enabled,
            "Gateway state compiled"
        );
        Ok(state)
    }
}

/// Gather every CA the document mentions, in a stable order.
fn collect_cas(doc: &GatewayDocument) -> Result<IssuingCaPool, ConfigError> {
    let mut pool = IssuingCaPool::new();

    for (_, spec) in doc.certificates.iter() {
        if let Some(cert) = &spec.certificate {
            pool.add(&cert.ca)?;
        }
        if let Some(trusted) = &spec.trusted_ca {
            pool.add(&trusted.ca)?;
        }
    }
    for ca in &doc.trusted_cas {
        pool.add(ca)?;
    }
    if let Some(cert) = &doc.tls.certificate {
        pool.add(&cert.ca)?;
    }

    let mut names: Vec<&String> = doc.services.keys().collect();
    names.sort();
    for name in names {
        let ca = doc.services[name]
            .upstream
            .as_ref()
            .and_then(|u| u.ssl_cert.as_ref())
            .map(|c| c.ca.as_str());
        if let Some(ca) = ca {
            pool.add(ca)?;
        }
    }

    Ok(pool)
}

/// The published gateway state.
#[derive(Debug)]
pub struct SharedState {
    current: ArcSwap<GatewayState>,
}

impl SharedState {
    pub fn new(state: GatewayState) -> Self {
        Self {
            current: ArcSwap::from_pointee(state),
        }
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<GatewayState> {
        self.current.load_full()
    }

    /// Replace the current snapshot. In-flight connections keep the old one.
    pub fn store(&self, state: GatewayState) {
        self.current.store(Arc::new(state));
    }
}
