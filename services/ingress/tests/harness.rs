//! Test harness for ingress integration tests.
//!
//! Provides helpers to spawn HTTP (plain or TLS), streaming and raw TLS
//! backends, an in-process ingress with both listeners, a minimal
//! keep-alive HTTP/1.1 client and rcgen certificate helpers.

#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use rustls::server::WebPkiClientVerifier;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sluice_ingress::access_log::AccessLogger;
use sluice_ingress::{
    GatewayDocument, GatewayState, Listener, ListenerConfig, ListenerKind, Metrics, Pipeline,
    SharedState,
};

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// What an [`HttpBackend`] saw for one request.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

/// An HTTP/1.1 backend that answers every request with
/// `<marker> <method> <path>`.
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub marker: String,
    pub connections: Arc<AtomicU64>,
    /// TLS connections on which the client presented a certificate.
    pub client_certs: Arc<AtomicU64>,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        Self::spawn_inner(marker, None).await
    }

    /// Serve HTTPS with the given leaf (cert PEM, key PEM). With `client_ca`
    /// set, clients must present a certificate issued by it.
    pub async fn spawn_tls(
        marker: &str,
        leaf: (&str, &str),
        client_ca: Option<&TestCa>,
    ) -> io::Result<Self> {
        init_crypto_provider();

        let chain = rustls_pemfile::certs(&mut leaf.0.as_bytes()).collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut leaf.1.as_bytes())?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key"))?;

        let builder = rustls::ServerConfig::builder();
        let builder = match client_ca {
            Some(ca) => {
                let mut roots = rustls::RootCertStore::empty();
                roots.add(ca.der()).map_err(io::Error::other)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(io::Error::other)?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let config = builder
            .with_single_cert(chain, key)
            .map_err(io::Error::other)?;

        Self::spawn_inner(marker, Some(TlsAcceptor::from(Arc::new(config)))).await
    }

    async fn spawn_inner(marker: &str, acceptor: Option<TlsAcceptor>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let client_certs = Arc::new(AtomicU64::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let certs_clone = Arc::clone(&client_certs);
        let requests_clone = Arc::clone(&requests);
        let marker_clone = marker.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let requests = Arc::clone(&requests_clone);
                        let marker = marker_clone.clone();
                        let acceptor = acceptor.clone();
                        let client_certs = Arc::clone(&certs_clone);
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => {
                                    let Ok(tls_stream) = acceptor.accept(stream).await else {
                                        return;
                                    };
                                    if tls_stream.get_ref().1.peer_certificates().is_some() {
                                        client_certs.fetch_add(1, Ordering::Relaxed);
                                    }
                                    serve_marker(tls_stream, marker, requests).await;
                                }
                                None => serve_marker(stream, marker, requests).await,
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            marker: marker.to_string(),
            connections,
            client_certs,
            requests,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn client_cert_count(&self) -> u64 {
        self.client_certs.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Target entry for the gateway document.
    pub fn target(&self) -> serde_json::Value {
        serde_json::json!({"ip": self.addr.ip().to_string(), "port": self.addr.port()})
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_marker<S>(stream: S, marker: String, requests: Arc<Mutex<Vec<SeenRequest>>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let requests = Arc::clone(&requests);
        let marker = marker.clone();
        async move {
            let method = req.method().to_string();
            let path = req
                .uri()
                .path_and_query()
                .map(|p| p.to_string())
                .unwrap_or_default();
            let header = |name: hyper::header::HeaderName| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let host = header(hyper::header::HOST);
            let authorization = header(hyper::header::AUTHORIZATION);
            let body = req
                .into_body()
                .collect()
                .await
                .map(|c| c.to_bytes().to_vec())
                .unwrap_or_default();

            let reply = format!("{marker} {method} {path}");
            requests.lock().unwrap().push(SeenRequest {
                method,
                path,
                host,
                authorization,
                body,
            });

            let response = Response::builder()
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(reply)))
                .unwrap();
            Ok::<_, Infallible>(response)
        }
    });
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
}

/// An HTTP/1.1 backend that sends a chunked response head and `marker` as
/// the first chunk, then holds the body open until [`finish`] is called and
/// ends it with a `-done` chunk.
///
/// [`finish`]: StreamingBackend::finish
pub struct StreamingBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    release: watch::Sender<bool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StreamingBackend {
    pub async fn spawn(marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (release, release_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let marker = marker.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((mut stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);
                        let mut release_rx = release_rx.clone();
                        let marker = marker.clone();
                        tokio::spawn(async move {
                            if read_until(&mut stream, b"\r\n\r\n", Duration::from_secs(5))
                                .await
                                .is_err()
                            {
                                return;
                            }
                            let head = format!(
                                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n{}",
                                chunk(&marker)
                            );
                            if stream.write_all(head.as_bytes()).await.is_err() {
                                return;
                            }
                            let _ = stream.flush().await;
                            if release_rx.wait_for(|released| *released).await.is_err() {
                                return;
                            }
                            let tail = format!("{}0\r\n\r\n", chunk("-done"));
                            let _ = stream.write_all(tail.as_bytes()).await;
                            let mut sink = Vec::new();
                            let _ = stream.read_to_end(&mut sink).await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            release,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Let every open response finish.
    pub fn finish(&self) {
        let _ = self.release.send(true);
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> serde_json::Value {
        serde_json::json!({"ip": self.addr.ip().to_string(), "port": self.addr.port()})
    }
}

impl Drop for StreamingBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn chunk(data: &str) -> String {
    format!("{:x}\r\n{}\r\n", data.len(), data)
}

/// A TLS backend that answers the first read with its marker.
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    pub marker: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let connections = Arc::new(AtomicU64::new(0));
        let conn_clone = Arc::clone(&connections);
        let marker_bytes = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let acceptor = acceptor.clone();
                                let response = marker_bytes.clone();
                                tokio::spawn(async move {
                                    if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                                        let mut buf = vec![0u8; 1024];
                                        if tls_stream.read(&mut buf).await.is_ok() {
                                            let _ = tls_stream.write_all(&response).await;
                                            let _ = tls_stream.shutdown().await;
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            marker: marker.to_string(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An in-process ingress with an HTTP and a TLS listener on loopback.
pub struct IngressHandle {
    pub http_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    pub state: Arc<SharedState>,
    pub metrics: Arc<Metrics>,
    pub pipeline: Arc<Pipeline>,
}

impl IngressHandle {
    pub async fn spawn(doc: serde_json::Value) -> io::Result<Self> {
        Self::spawn_with(doc, AccessLogger::disabled(), |p| p).await
    }

    /// Spawn with access logging delivered to the returned receiver.
    pub async fn spawn_logged(
        doc: serde_json::Value,
    ) -> io::Result<(Self, mpsc::Receiver<String>)> {
        let (logger, rx) = AccessLogger::channel(64);
        Ok((Self::spawn_with(doc, logger, |p| p).await?, rx))
    }

    /// Spawn with extra pipeline settings applied by `configure`.
    pub async fn spawn_configured(
        doc: serde_json::Value,
        configure: impl FnOnce(Pipeline) -> Pipeline,
    ) -> io::Result<Self> {
        Self::spawn_with(doc, AccessLogger::disabled(), configure).await
    }

    async fn spawn_with(
        doc: serde_json::Value,
        logger: AccessLogger,
        configure: impl FnOnce(Pipeline) -> Pipeline,
    ) -> io::Result<Self> {
        init_crypto_provider();

        let doc: GatewayDocument = serde_json::from_value(doc).map_err(io::Error::other)?;
        let state = GatewayState::compile(&doc).map_err(io::Error::other)?;
        let state = Arc::new(SharedState::new(state));
        let metrics = Arc::new(Metrics::new());
        let pipeline = Arc::new(configure(
            Pipeline::new(Arc::clone(&state), Arc::clone(&metrics), logger)
                .with_instance_name("ingress-test")
                .with_connect_timeout(Duration::from_millis(500)),
        ));

        let mut addrs = Vec::new();
        for kind in [ListenerKind::Http, ListenerKind::Tls] {
            let mut config = ListenerConfig::new(kind, "127.0.0.1:0".parse().unwrap());
            config.passthrough_connect_timeout = Duration::from_millis(500);
            let listener = Listener::bind(config, Arc::clone(&pipeline)).await?;
            addrs.push(listener.local_addr()?);
            let listener = Arc::new(listener);
            tokio::spawn(async move {
                let _ = listener.run().await;
            });
        }

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            http_addr: addrs[0],
            tls_addr: addrs[1],
            state,
            metrics,
            pipeline,
        })
    }
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send one request on `stream` and read one content-length framed response.
/// The connection stays usable for the next request.
pub async fn send_request<S>(
    stream: &mut S,
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> io::Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    tokio::time::timeout(Duration::from_secs(5), read_response(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response timeout"))?
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<HttpResponse> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head).into_owned();
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.split(' ').nth(1))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    Ok(HttpResponse {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Read from `stream` until the bytes read so far contain `needle`.
pub async fn read_until<S>(stream: &mut S, needle: &[u8], limit: Duration) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let read = async {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !received.windows(needle.len()).any(|w| w == needle) {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed early",
                ));
            }
            received.extend_from_slice(&buf[..n]);
        }
        Ok(received)
    };
    tokio::time::timeout(limit, read)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))?
}

/// One request on a fresh plain connection.
pub async fn http_get(addr: SocketAddr, host: &str, path: &str) -> io::Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    send_request(&mut stream, "GET", host, path, &[], "").await
}

/// A self-signed CA able to issue leaf certificates.
pub struct TestCa {
    pub cert: rcgen::Certificate,
    pub key: rcgen::KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue a leaf; returns (cert PEM, key PEM).
    pub fn issue(&self, name: &str, usage: ExtendedKeyUsagePurpose) -> (String, String) {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

/// Connect with TLS, trusting `roots` and optionally presenting a client
/// certificate given as (cert PEM, key PEM).
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: ServerName<'static>,
    roots: &[CertificateDer<'static>],
    client_cert: Option<(&str, &str)>,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    for root in roots {
        root_store.add(root.clone()).map_err(io::Error::other)?;
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
    let config = match client_cert {
        Some((cert, key)) => {
            let chain = rustls_pemfile::certs(&mut cert.as_bytes())
                .collect::<Result<Vec<_>, _>>()?;
            let key = rustls_pemfile::private_key(&mut key.as_bytes())?
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key"))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(io::Error::other)?
        }
        None => builder.with_no_client_auth(),
    };

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    connector.connect(server_name, stream).await
}

pub fn dns_name(name: &str) -> ServerName<'static> {
    ServerName::try_from(name.to_string()).unwrap()
}
