//! TCP listeners and connection handling.
//!
//! An HTTP listener hands each accepted connection straight to the
//! [`Pipeline`]. A TLS listener first sniffs the ClientHello and then either
//! splices the connection to its SNI host untouched or terminates TLS with
//! the certificate chosen for that SNI.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::forward::{ConnectionInfo, Pipeline};
use super::handshake::{decide, terminate, PrefixedStream, TlsDecision};
use super::sni::{SniConfig, SniInspector, SniResult};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default timeout for dialing a passthrough upstream.
pub const DEFAULT_PASSTHROUGH_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Tls,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub kind: ListenerKind,
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub sni_config: SniConfig,
    /// Idle timeout for passthrough connections.
    pub idle_timeout: Option<Duration>,
    pub passthrough_connect_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(kind: ListenerKind, bind_addr: SocketAddr) -> Self {
        Self {
            kind,
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sni_config: SniConfig::default(),
            idle_timeout: None,
            passthrough_connect_timeout: DEFAULT_PASSTHROUGH_CONNECT_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_closed: AtomicU64,
    /// Connections refused at the max-connections limit.
    pub connections_rejected: AtomicU64,
    pub tls_terminated: AtomicU64,
    pub tls_passthrough: AtomicU64,
    /// ClientHello rejected or TLS handshake failed.
    pub tls_failed: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_from_upstream: AtomicU64,
}

pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    conn_semaphore: Arc<Semaphore>,
    sni_inspector: SniInspector,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, pipeline: Arc<Pipeline>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            kind = ?config.kind,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            sni_inspector: SniInspector::with_config(config.sni_config.clone()),
            listener,
            config,
            pipeline,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, kind = ?self.config.kind, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let local_addr = client.local_addr()?;
        let _ = client.set_nodelay(true);

        match self.config.kind {
            ListenerKind::Http => {
                let conn = ConnectionInfo {
                    peer_addr,
                    local_addr,
                    tls: false,
                };
                let snapshot = self.pipeline.state().load();
                self.pipeline
                    .serve(client, conn, snapshot)
                    .await
                    .map_err(io::Error::other)
            }
            ListenerKind::Tls => self.handle_tls(client, peer_addr, local_addr).await,
        }
    }

    async fn handle_tls(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> io::Result<()> {
        let snapshot = self.pipeline.state().load();

        let mut sniffed = Vec::new();
        let hello = self.sni_inspector.inspect(&mut client, &mut sniffed).await;
        if let SniResult::IoError(e) = &hello {
            self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
            return Err(io::Error::other(e.clone()));
        }

        match decide(&snapshot.passthrough, &hello) {
            TlsDecision::Rejected(reason) => {
                self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
                debug!(reason = ?reason, "ClientHello rejected");
                Ok(())
            }
            TlsDecision::Passthrough { sni, upstream } => {
                self.stats.tls_passthrough.fetch_add(1, Ordering::Relaxed);
                debug!(sni = %sni, upstream = %upstream, "TLS passthrough");
                self.passthrough(client, &upstream, &sniffed).await
            }
            TlsDecision::TerminateTls { sni } => {
                let stream = PrefixedStream::new(sniffed, client);
                let (tls, entry) = match terminate(stream, &snapshot.certificates, sni.as_deref())
                    .await
                {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        self.stats.tls_failed.fetch_add(1, Ordering::Relaxed);
                        debug!(sni = ?sni, error = %e, "TLS termination failed");
                        return Ok(());
                    }
                };
                self.stats.tls_terminated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    sni = ?sni,
                    certificate = %entry.host_pattern,
                    client_auth = entry.requires_client_cert,
                    "TLS established"
                );

                let conn = ConnectionInfo {
                    peer_addr,
                    local_addr,
                    tls: true,
                };
                self.pipeline
                    .serve(tls, conn, snapshot)
                    .await
                    .map_err(io::Error::other)
            }
        }
    }

    async fn passthrough(
        &self,
        mut client: TcpStream,
        upstream: &str,
        sniffed: &[u8],
    ) -> io::Result<()> {
        let connect = TcpStream::connect(upstream);
        let mut backend =
            match tokio::time::timeout(self.config.passthrough_connect_timeout, connect).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(upstream = %upstream, error = %e, "Passthrough upstream unreachable");
                    return Ok(());
                }
                Err(_) => {
                    warn!(upstream = %upstream, "Passthrough upstream connect timeout");
                    return Ok(());
                }
            };
        let _ = backend.set_nodelay(true);

        backend.write_all(sniffed).await?;

        let (to_upstream, from_upstream) =
            proxy_bidirectional(&mut client, &mut backend, self.config.idle_timeout).await?;

        self.stats
            .bytes_to_upstream
            .fetch_add(to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_from_upstream
            .fetch_add(from_upstream, Ordering::Relaxed);

        debug!(
            bytes_to_upstream = to_upstream,
            bytes_from_upstream = from_upstream,
            "Passthrough closed"
        );
        Ok(())
    }
}

/// Copy bytes both ways until both sides close.
///
/// Returns (bytes_to_b, bytes_from_b).
async fn proxy_bidirectional<A, B>(
    a: &mut A,
    b: &mut B,
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_result, b_result) = tokio::join!(
        copy_half(&mut a_read, &mut b_write, idle_timeout),
        copy_half(&mut b_read, &mut a_write, idle_timeout)
    );

    // Return bytes transferred even if one direction errored
    Ok((a_result.unwrap_or(0), b_result.unwrap_or(0)))
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 8192];
    loop {
        let read_result = match idle_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read_result? {
            0 => break,
            n => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new(ListenerKind::Tls, "[::]:8443".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.kind, ListenerKind::Tls);
    }

    #[tokio::test]
    async fn test_proxy_bidirectional_counts_bytes() {
        let (mut client, mut client_peer) = tokio::io::duplex(1024);
        let (mut upstream, mut upstream_peer) = tokio::io::duplex(1024);

        let splice = tokio::spawn(async move {
            proxy_bidirectional(&mut client_peer, &mut upstream_peer, None).await
        });

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        received.extend_from_slice(&buf);
        upstream.write_all(b"world!").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert_eq!(received, b"hello");
        assert_eq!(reply, b"world!");
        assert_eq!(splice.await.unwrap().unwrap(), (5, 6));
    }
}
