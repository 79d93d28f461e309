mod harness;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use harness::{
    dns_name, send_request, tls_client_connect, HttpBackend, IngressHandle, TestCa, TlsBackend,
};
use rcgen::ExtendedKeyUsagePurpose;
use rustls::pki_types::{CertificateDer, ServerName};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn passthrough_splices_to_sni_host() {
    let backend = TlsBackend::spawn("localhost", "BACKEND_OK").await.unwrap();
    let ingress = IngressHandle::spawn(json!({
        "tls": {"enabled": true},
        "sslPassthrough": {"enabled": true, "upstreamPort": backend.addr.port()}
    }))
    .await
    .unwrap();

    let roots = [CertificateDer::from(backend.cert_der.clone())];
    let mut tls = tls_client_connect(ingress.tls_addr, dns_name("localhost"), &roots, None)
        .await
        .unwrap();
    tls.write_all(b"ping").await.unwrap();

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), tls.read_to_end(&mut buf)).await;
    assert_eq!(buf, b"BACKEND_OK");
    assert_eq!(backend.connection_count(), 1);
    // Passthrough traffic never reaches the HTTP pipeline.
    assert_eq!(ingress.metrics.requests.total(), 0);
}

#[tokio::test]
async fn passthrough_without_sni_is_rejected() {
    let backend = TlsBackend::spawn("localhost", "BACKEND_OK").await.unwrap();
    let ingress = IngressHandle::spawn(json!({
        "tls": {"enabled": true},
        "sslPassthrough": {"enabled": true, "upstreamPort": backend.addr.port()}
    }))
    .await
    .unwrap();

    // An IP server name makes the client omit SNI.
    let roots = [CertificateDer::from(backend.cert_der.clone())];
    let result = tls_client_connect(
        ingress.tls_addr,
        ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into()),
        &roots,
        None,
    )
    .await;

    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn terminated_tls_routes_to_http_backend() {
    let ca = TestCa::new("Ingress Server CA");
    let (cert, key) = ca.issue("secure.example.com", ExtendedKeyUsagePurpose::ServerAuth);
    let backend = HttpBackend::spawn("A").await.unwrap();

    // Passthrough is limited to another host, so this SNI is terminated.
    let ingress = IngressHandle::spawn(json!({
        "tls": {"enabled": true},
        "sslPassthrough": {"enabled": true, "hosts": ["passthrough.example.com"]},
        "certificates": {
            "secure.example.com": {"isTLS": true, "certificate": {"cert": cert, "key": key}}
        },
        "routes": {"secure.example.com/": {"service": "svcA", "serviceId": "secure-1"}},
        "services": {"svcA": {"targets": [backend.target()]}}
    }))
    .await
    .unwrap();

    let mut tls = tls_client_connect(
        ingress.tls_addr,
        dns_name("secure.example.com"),
        &[ca.der()],
        None,
    )
    .await
    .unwrap();

    for _ in 0..2 {
        let response = send_request(&mut tls, "GET", "secure.example.com", "/hello", &[], "")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "A GET /hello");
    }
    assert_eq!(ingress.metrics.service_requests.get(&["svcA"]), 2);
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn wildcard_certificate_and_default_fallback() {
    let ca = TestCa::new("Ingress Server CA");
    let (wild_cert, wild_key) = ca.issue("*.apps.example.com", ExtendedKeyUsagePurpose::ServerAuth);
    let (default_cert, default_key) =
        ca.issue("fallback.example.com", ExtendedKeyUsagePurpose::ServerAuth);
    let backend = HttpBackend::spawn("A").await.unwrap();

    let ingress = IngressHandle::spawn(json!({
        "tls": {"enabled": true, "certificate": {"cert": default_cert, "key": default_key}},
        "certificates": {
            "*.apps.example.com": {
                "isWildcardHost": true,
                "certificate": {"cert": wild_cert, "key": wild_key}
            }
        },
        "routes": {"/": {"service": "svcA"}},
        "services": {"svcA": {"targets": [backend.target()]}}
    }))
    .await
    .unwrap();

    let mut wild = tls_client_connect(
        ingress.tls_addr,
        dns_name("one.apps.example.com"),
        &[ca.der()],
        None,
    )
    .await
    .unwrap();
    let response = send_request(&mut wild, "GET", "one.apps.example.com", "/", &[], "")
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    // Unknown SNI gets the default certificate, which names another host.
    let mismatched = tls_client_connect(
        ingress.tls_addr,
        dns_name("other.example.com"),
        &[ca.der()],
        None,
    )
    .await;
    assert!(mismatched.is_err());

    let fallback = tls_client_connect(
        ingress.tls_addr,
        dns_name("fallback.example.com"),
        &[ca.der()],
        None,
    )
    .await;
    assert!(fallback.is_ok());
}
