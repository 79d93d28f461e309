//! TLS listener decision logic.
//!
//! ```text
//! AwaitClientHello --sniffed--> Passthrough --dialed--> Established
//!                          \--> TerminateTls --accepted--> Established
//!                          \--> Rejected
//! ```
//!
//! The ClientHello is read by the [`SniInspector`](super::SniInspector)
//! before any decision; [`PrefixedStream`] replays those bytes to whichever
//! side consumes the connection next.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::proxy::certs::{CertEntry, CertificateStore};
use crate::proxy::router::normalize_host;
use crate::proxy::sni::SniResult;
use crate::schema::PassthroughSpec;

/// Which TLS connections are spliced to their SNI host untouched.
#[derive(Debug, Clone, Default)]
pub struct PassthroughPolicy {
    pub enabled: bool,
    pub upstream_port: u16,
    /// Eligible hostnames; empty means every hostname.
    pub hosts: HashSet<String>,
}

impl PassthroughPolicy {
    pub fn from_spec(spec: &PassthroughSpec) -> Self {
        Self {
            enabled: spec.enabled,
            upstream_port: spec.upstream_port,
            hosts: spec.hosts.iter().map(|h| normalize_host(h)).collect(),
        }
    }

    fn passes_all(&self) -> bool {
        self.enabled && self.hosts.is_empty()
    }

    fn passes(&self, sni: &str) -> bool {
        self.enabled && (self.hosts.is_empty() || self.hosts.contains(sni))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Passthrough needs a hostname to dial.
    EmptySni,
    NotTls,
    Malformed,
    Timeout,
    Io,
}

/// Outcome of the ClientHello inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsDecision {
    TerminateTls { sni: Option<String> },
    Passthrough { sni: String, upstream: String },
    Rejected(RejectReason),
}

/// Decide what to do with a connection from its sniffed ClientHello.
pub fn decide(policy: &PassthroughPolicy, hello: &SniResult) -> TlsDecision {
    let sni = match hello {
        SniResult::Found(host) => Some(host.as_str()),
        SniResult::NoSni => None,
        SniResult::NotTls => return TlsDecision::Rejected(RejectReason::NotTls),
        SniResult::Malformed => return TlsDecision::Rejected(RejectReason::Malformed),
        SniResult::Timeout => return TlsDecision::Rejected(RejectReason::Timeout),
        SniResult::IoError(_) => return TlsDecision::Rejected(RejectReason::Io),
    };

    match sni {
        Some(host) if policy.passes(host) => TlsDecision::Passthrough {
            sni: host.to_string(),
            upstream: format!("{}:{}", host, policy.upstream_port),
        },
        None if policy.passes_all() => TlsDecision::Rejected(RejectReason::EmptySni),
        sni => TlsDecision::TerminateTls {
            sni: sni.map(str::to_string),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no certificate for SNI {0:?}")]
    NoCertificate(Option<String>),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),
}

/// Terminate TLS with the certificate selected for `sni`.
pub async fn terminate<S>(
    stream: PrefixedStream<S>,
    store: &CertificateStore,
    sni: Option<&str>,
) -> Result<(TlsStream<PrefixedStream<S>>, Arc<CertEntry>), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let entry = store
        .resolve(sni)
        .cloned()
        .ok_or_else(|| HandshakeError::NoCertificate(sni.map(str::to_string)))?;
    let acceptor = TlsAcceptor::from(entry.server_config.clone());
    let tls = acceptor.accept(stream).await?;
    Ok((tls, entry))
}

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let pending = &this.prefix[this.pos..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
