//! Upstream connection pool.
//!
//! Slots are allocated process-wide so the number of live upstream
//! connections is observable; the connections themselves are owned by the
//! inbound connection that opened them (see [`ConnectionContext`]) and are
//! reused across its keep-alive requests.
//!
//! [`ConnectionContext`]: crate::proxy::session::ConnectionContext

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::ForwardError;
use crate::proxy::balancer::Target;
use crate::proxy::forward::Body;
use crate::proxy::tls::UpstreamTls;

/// Default connect timeout for upstream connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifier of one upstream connection slot. Never reused.
pub type SlotId = u64;

/// Process-wide slot bookkeeping.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    /// Last slot handed out.
    next: AtomicU64,
    /// Allocated slots and the target each one connects to.
    live: DashMap<SlotId, Target>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot for a connection to `target`.
    pub fn allocate(&self, target: &Target) -> SlotId {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.insert(slot, target.clone());
        trace!(slot, target = %target, "Allocated upstream slot");
        slot
    }

    /// Release a slot. Freeing an unknown or already freed slot is a no-op.
    pub fn free(&self, slot: SlotId) -> bool {
        let freed = self.live.remove(&slot).is_some();
        if freed {
            trace!(slot, "Freed upstream slot");
        }
        freed
    }

    /// Whether `slot` is currently allocated.
    pub fn is_live(&self, slot: SlotId) -> bool {
        self.live.contains_key(&slot)
    }

    /// Number of allocated slots.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Allocated slots for `target`.
    pub fn live_for(&self, target: &Target) -> usize {
        self.live.iter().filter(|e| e.value() == target).count()
    }
}

/// An upstream connection held by one inbound connection.
#[derive(Debug)]
pub struct PooledConnection {
    /// Slot reserved in the [`ConnectionPool`].
    pub slot: SlotId,
    /// HTTP sender, `None` until dialed or after the connection was dropped.
    pub sender: Option<SendRequest<Body>>,
}

impl PooledConnection {
    /// A slot with no connection yet.
    pub fn new(slot: SlotId) -> Self {
        Self { slot, sender: None }
    }
}

/// Open an HTTP/1.1 connection to `target`, over TLS when `tls` is set.
pub async fn dial(
    target: &Target,
    tls: Option<&UpstreamTls>,
    connect_timeout: Duration,
) -> Result<SendRequest<Body>, ForwardError> {
    let addr = target.to_string();
    let tcp = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(ForwardError::Connect { target: addr, source }),
        Err(_) => return Err(ForwardError::ConnectTimeout(addr)),
    };
    let _ = tcp.set_nodelay(true);

    match tls {
        Some(tls) => {
            let server_name = tls.server_name_for(target)?;
            let connector = TlsConnector::from(tls.client_config.clone());
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|source| ForwardError::UpstreamTls {
                    target: addr.clone(),
                    source,
                })?;
            handshake(stream, addr).await
        }
        None => handshake(tcp, addr).await,
    }
}

/// Why [`try_send`] did not produce a response.
pub enum SendError {
    /// Nothing was written; the request is handed back for a retry.
    Unsent(Request<Body>, hyper::Error),
    /// The request was (at least partly) sent and cannot be replayed.
    Failed(hyper::Error),
}

/// Send `request` on a cached connection.
pub async fn try_send(
    sender: &mut SendRequest<Body>,
    request: Request<Body>,
) -> Result<Response<Incoming>, SendError> {
    if let Err(e) = sender.ready().await {
        return Err(SendError::Unsent(request, e));
    }
    sender
        .try_send_request(request)
        .await
        .map_err(|mut e| match e.take_message() {
            Some(request) => SendError::Unsent(request, e.into_error()),
            None => SendError::Failed(e.into_error()),
        })
}

async fn handshake<S>(stream: S, addr: String) -> Result<SendRequest<Body>, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(target = %addr, error = %e, "Upstream connection closed with error");
        }
    });
    Ok(sender)
}
