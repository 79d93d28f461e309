//! Issuing CA pool.
//!
//! One deduplicated set of trusted CA certificates collected from every
//! source in the gateway document. It backs inbound client verification and
//! upstream server verification alike.

use std::collections::HashSet;

use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::proxy::tls::pem_certs;

/// Deduplicated, ordered set of trusted CA certificates.
#[derive(Debug, Clone, Default)]
pub struct IssuingCaPool {
    /// SHA-256 hex digests of the PEM blobs added so far.
    seen: HashSet<String>,
    /// Certificates in insertion order.
    certs: Vec<CertificateDer<'static>>,
}

impl IssuingCaPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a PEM blob. Returns `false` when the exact bytes were added before
    /// or the blob is blank.
    pub fn add(&mut self, pem: &str) -> Result<bool, ConfigError> {
        if pem.trim().is_empty() {
            return Ok(false);
        }

        let digest = hex::encode(Sha256::digest(pem.as_bytes()));
        if self.seen.contains(&digest) {
            debug!(digest = %&digest[..16], "CA already in pool");
            return Ok(false);
        }

        let certs = pem_certs(pem).map_err(ConfigError::InvalidCa)?;
        if certs.is_empty() {
            return Err(ConfigError::InvalidCa(
                "no certificate found in PEM".to_string(),
            ));
        }

        self.certs.extend(certs);
        self.seen.insert(digest);
        Ok(true)
    }

    /// Every trusted certificate, in the order added.
    pub fn trusted(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Number of certificates (a PEM blob may hold several).
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Trust anchors for rustls verifiers.
    pub fn root_store(&self) -> RootCertStore {
        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(self.certs.iter().cloned());
        if ignored > 0 {
            warn!(added, ignored, "Some CA certificates could not be used as trust anchors");
        }
        store
    }
}
