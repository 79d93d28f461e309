//! TLS material and rustls configuration.
//!
//! Everything here runs at load time: PEM is parsed once, and each
//! certificate entry and upstream service gets a prebuilt rustls config.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};

use crate::error::{ConfigError, ForwardError};
use crate::proxy::balancer::Target;
use crate::proxy::trust::IssuingCaPool;
use crate::schema::{CertificateSpec, UpstreamSpec};

/// The process-wide crypto provider (ring).
pub fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Parse every certificate in a PEM blob.
pub fn pem_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("malformed certificate PEM: {e}"))
}

/// Parse the first private key in a PEM blob.
pub fn pem_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, String> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| format!("malformed key PEM: {e}"))?
        .ok_or_else(|| "no private key found in PEM".to_string())
}

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct KeyPair {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl KeyPair {
    pub fn from_pem(cert: &str, key: &str) -> Result<Self, String> {
        let chain = pem_certs(cert)?;
        if chain.is_empty() {
            return Err("no certificate found in PEM".to_string());
        }
        let key = pem_private_key(key)?;
        Ok(Self { chain, key })
    }
}

/// Client certificate verification for one certificate entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAuth {
    /// Maximum chain depth above the leaf (OpenSSL `verify_depth` semantics).
    pub verify_depth: u32,
}

/// Build the server config for one certificate entry.
///
/// With `client_auth` set, clients must present a certificate that chains to
/// `pool` within the configured depth.
pub fn server_config(
    pair: &KeyPair,
    client_auth: Option<ClientAuth>,
    pool: &IssuingCaPool,
) -> Result<ServerConfig, ConfigError> {
    let builder =
        ServerConfig::builder_with_provider(crypto_provider()).with_safe_default_protocol_versions()?;

    let builder = match client_auth {
        Some(auth) => {
            let inner = WebPkiClientVerifier::builder_with_provider(
                Arc::new(pool.root_store()),
                crypto_provider(),
            )
            .build()?;
            builder.with_client_cert_verifier(Arc::new(DepthLimitedVerifier {
                inner,
                max_depth: auth.verify_depth.max(1) as usize,
            }))
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(pair.chain.clone(), pair.key.clone_key())?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Rejects client chains longer than `max_depth` certificates above the leaf,
/// then defers to webpki.
#[derive(Debug)]
struct DepthLimitedVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    max_depth: usize,
}

impl ClientCertVerifier for DepthLimitedVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        // The issuing root sits in the trust store, so a depth of N leaves
        // room for N - 1 intermediates.
        if intermediates.len() >= self.max_depth {
            return Err(rustls::Error::General(format!(
                "client certificate chain exceeds verify depth {}",
                self.max_depth
            )));
        }
        self.inner.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any upstream certificate. Used when `sslVerify` is off.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Re-encryption settings for one upstream service.
#[derive(Debug, Clone)]
pub struct UpstreamTls {
    pub client_config: Arc<ClientConfig>,
    /// Fixed SNI name. `None` disables SNI and verifies against the target IP.
    pub server_name: Option<ServerName<'static>>,
}

impl UpstreamTls {
    pub fn build(
        service: &str,
        spec: &UpstreamSpec,
        pool: &IssuingCaPool,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidService {
            service: service.to_string(),
            reason,
        };

        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?;
        let builder = if spec.ssl_verify {
            builder.with_root_certificates(pool.root_store())
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                    provider: crypto_provider(),
                }))
        };

        let mut config = match spec.ssl_cert.as_ref().filter(|c| c.has_key_pair()) {
            Some(CertificateSpec { cert, key, .. }) => {
                let pair = KeyPair::from_pem(cert, key).map_err(invalid)?;
                builder.with_client_auth_cert(pair.chain, pair.key)?
            }
            None => builder.with_no_client_auth(),
        };

        let server_name = match spec.ssl_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => Some(
                ServerName::try_from(name.to_string())
                    .map_err(|_| invalid(format!("invalid sslName '{name}'")))?,
            ),
            None => None,
        };
        config.enable_sni = server_name.is_some();

        Ok(Self {
            client_config: Arc::new(config),
            server_name,
        })
    }

    /// Name presented to (and verified against) `target`.
    pub fn server_name_for(&self, target: &Target) -> Result<ServerName<'static>, ForwardError> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        match target.host.parse::<IpAddr>() {
            Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
            Err(_) => ServerName::try_from(target.host.clone())
                .map_err(|_| ForwardError::ServerName(target.host.clone())),
        }
    }
}
