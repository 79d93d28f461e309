//! Per-service load balancing.
//!
//! Strategies:
//! - round-robin: shared cursor over the target list
//! - least-work: target with the fewest outstanding selections
//! - hashing: stable target per key, round-robin when no key is given
//!
//! Every selection is paired with a `deselect` once the work finishes;
//! [`Lease`] does this on drop.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::proxy::tls::UpstreamTls;
use crate::schema::BalancerKind;

/// A backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// IP address or hostname.
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Create a target from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// How a [`LoadBalancer`] picks among its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Next target after the shared cursor.
    RoundRobin,
    /// Target with the fewest outstanding selections; ties go to the first.
    LeastWork,
    /// Target derived from the selection key.
    Hashing,
}

impl From<BalancerKind> for Strategy {
    fn from(kind: BalancerKind) -> Self {
        match kind {
            BalancerKind::RoundRobin => Strategy::RoundRobin,
            BalancerKind::LeastWork => Strategy::LeastWork,
            BalancerKind::Hashing => Strategy::Hashing,
        }
    }
}

/// Target selection for one service, shared by every connection.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
    targets: Vec<Target>,
    /// Round-robin position.
    cursor: AtomicUsize,
    /// Outstanding selections per target.
    load: Vec<AtomicUsize>,
}

impl LoadBalancer {
    /// Create a balancer over `targets`, all idle.
    pub fn new(strategy: Strategy, targets: Vec<Target>) -> Self {
        let load = targets.iter().map(|_| AtomicUsize::new(0)).collect();
        Self {
            strategy,
            targets,
            cursor: AtomicUsize::new(0),
            load,
        }
    }

    /// Pick a target index. `None` when there are no targets.
    pub fn select(&self, key: Option<&str>) -> Option<usize> {
        if self.targets.is_empty() {
            return None;
        }
        let len = self.targets.len();

        let index = match (self.strategy, key) {
            (Strategy::LeastWork, _) => self
                .load
                .iter()
                .enumerate()
                .min_by_key(|(_, load)| load.load(Ordering::Relaxed))
                .map(|(idx, _)| idx)
                .unwrap_or(0),
            (Strategy::Hashing, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % len as u64) as usize
            }
            (Strategy::RoundRobin, _) | (Strategy::Hashing, None) => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % len
            }
        };

        self.load[index].fetch_add(1, Ordering::Relaxed);
        Some(index)
    }

    /// Release one selection of `index`.
    pub fn deselect(&self, index: usize) {
        if let Some(load) = self.load.get(index) {
            let _ = load.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Target at `index`.
    pub fn target(&self, index: usize) -> Option<&Target> {
        self.targets.get(index)
    }

    /// All targets in declaration order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Outstanding selections of `index`.
    pub fn load(&self, index: usize) -> usize {
        self.load
            .get(index)
            .map(|l| l.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Select and wrap the result so it is released on drop.
    pub fn lease(self: &Arc<Self>, key: Option<&str>) -> Option<Lease> {
        let index = self.select(key)?;
        Some(Lease {
            target: self.targets[index].clone(),
            balancer: Arc::clone(self),
            index,
        })
    }
}

/// A selected target, deselected when dropped.
#[derive(Debug)]
pub struct Lease {
    balancer: Arc<LoadBalancer>,
    index: usize,
    target: Target,
}

impl Lease {
    /// The selected target.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.balancer.deselect(self.index);
    }
}

/// A logical backend service.
#[derive(Debug)]
pub struct Service {
    /// Name routes refer to.
    pub name: String,
    pub balancer: Arc<LoadBalancer>,
    /// Pin targets per sticky key for the lifetime of the inbound connection.
    pub sticky: bool,
    /// Re-encryption settings; `None` forwards plain HTTP.
    pub upstream: Option<UpstreamTls>,
}
