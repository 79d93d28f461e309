//! Per-inbound-connection state.
//!
//! A [`ConnectionContext`] lives exactly as long as one inbound connection.
//! It owns the sticky target cache and the upstream connections opened on
//! behalf of that connection; dropping it deselects every sticky target and
//! frees every pool slot, whether the client closed cleanly or not.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hyper::client::conn::http1::SendRequest;
use tracing::debug;

use crate::error::ForwardError;
use crate::proxy::balancer::{Lease, Service, Target};
use crate::proxy::forward::Body;
use crate::proxy::pool::{dial, ConnectionPool, PooledConnection};
use crate::proxy::tls::UpstreamTls;

/// The target chosen for one request.
#[derive(Debug)]
pub enum Selection {
    /// Held by the connection's sticky cache.
    Sticky(Target),
    /// Held by the request; released when dropped.
    Leased(Lease),
}

impl Selection {
    pub fn target(&self) -> &Target {
        match self {
            Selection::Sticky(target) => target,
            Selection::Leased(lease) => lease.target(),
        }
    }

    /// The lease the response must hold until it completes. Sticky
    /// selections are held by the connection instead.
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Selection::Sticky(_) => None,
            Selection::Leased(lease) => Some(lease),
        }
    }
}

#[derive(Debug)]
pub struct ConnectionContext {
    pool: Arc<ConnectionPool>,
    sticky: HashMap<(String, String), Lease>,
    upstreams: HashMap<Target, PooledConnection>,
}

impl ConnectionContext {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            sticky: HashMap::new(),
            upstreams: HashMap::new(),
        }
    }

    /// Choose a target of `service`.
    ///
    /// Sticky services with a non-empty key keep returning the same target
    /// for that key until the connection ends.
    pub fn select(&mut self, service: &Service, sticky_key: Option<&str>) -> Option<Selection> {
        let key = sticky_key.filter(|k| !k.is_empty());

        match key {
            Some(key) if service.sticky => {
                let cache_key = (service.name.clone(), key.to_string());
                if let Some(lease) = self.sticky.get(&cache_key) {
                    return Some(Selection::Sticky(lease.target().clone()));
                }
                let lease = service.balancer.lease(Some(key))?;
                let target = lease.target().clone();
                debug!(service = %service.name, target = %target, "Pinned sticky target");
                self.sticky.insert(cache_key, lease);
                Some(Selection::Sticky(target))
            }
            _ => service.balancer.lease(key).map(Selection::Leased),
        }
    }

    /// The HTTP sender for `target`, dialing (or re-dialing) as needed.
    pub async fn sender(
        &mut self,
        target: &Target,
        tls: Option<&UpstreamTls>,
        connect_timeout: Duration,
    ) -> Result<&mut SendRequest<Body>, ForwardError> {
        let pool = &self.pool;
        let conn = self
            .upstreams
            .entry(target.clone())
            .or_insert_with(|| PooledConnection::new(pool.allocate(target)));

        let sender = match conn.sender.take() {
            Some(sender) if !sender.is_closed() => sender,
            _ => {
                debug!(target = %target, slot = conn.slot, "Opening upstream connection");
                dial(target, tls, connect_timeout).await?
            }
        };
        Ok(conn.sender.insert(sender))
    }

    /// Replace the cached connection to `target` with a fresh one. The slot
    /// is kept.
    pub async fn redial(
        &mut self,
        target: &Target,
        tls: Option<&UpstreamTls>,
        connect_timeout: Duration,
    ) -> Result<&mut SendRequest<Body>, ForwardError> {
        if let Some(conn) = self.upstreams.get_mut(target) {
            conn.sender = None;
        }
        self.sender(target, tls, connect_timeout).await
    }

    /// Drop the upstream connection to `target` and free its slot.
    pub fn discard(&mut self, target: &Target) {
        if let Some(conn) = self.upstreams.remove(target) {
            self.pool.free(conn.slot);
        }
    }

    /// Release every sticky target and upstream connection.
    pub fn clear(&mut self) {
        self.sticky.clear();
        for (_, conn) in self.upstreams.drain() {
            self.pool.free(conn.slot);
        }
    }

    pub fn sticky_len(&self) -> usize {
        self.sticky.len()
    }

    pub fn upstream_len(&self) -> usize {
        self.upstreams.len()
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        self.clear();
    }
}
