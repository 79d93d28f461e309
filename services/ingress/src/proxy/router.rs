//! Request routing.
//!
//! Maps a decoded request to the logical service that should handle it.
//!
//! Lookup runs in two passes:
//! - Host + longest path prefix. Route keys are `host/path`; an empty host
//!   part matches any host and is consulted after host-specific routes.
//! - On miss, an ordered scan over routes that carry match rules. A route
//!   applies when any of its header, path or method rules matches; the first
//!   such route in declaration order wins.
//!
//! Hostnames are normalized to lowercase with the port and any trailing dot
//! removed. The router is immutable; a new one is compiled on reload.

use std::collections::HashMap;

use hyper::http::{HeaderMap, Method};
use regex::Regex;
use tracing::debug;

use crate::error::ConfigError;
use crate::schema::{MatchKind, OrderedMap, RouteSpec};

/// Normalize a hostname for matching.
///
/// - Strip a `:port` suffix (IPv6 literals keep their brackets' contents)
/// - Trim trailing dot
/// - Convert to lowercase
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                name
            }
            _ => host,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// One predicate of a match-rule route.
#[derive(Debug, Clone)]
pub enum MatchRule {
    /// Regex over a request header value (lowercased header name).
    Header { name: String, reg: Regex },
    /// Regex over the request path and query.
    Path { reg: Regex },
    /// Regex over the request method.
    Method { reg: Regex },
}

impl MatchRule {
    fn matches(&self, path: &str, headers: &HeaderMap, method: &Method) -> bool {
        match self {
            MatchRule::Header { name, reg } => headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| reg.is_match(v)),
            MatchRule::Path { reg } => reg.is_match(path),
            MatchRule::Method { reg } => reg.is_match(method.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rewrite {
    from: Regex,
    to: String,
}

impl Rewrite {
    /// Replace the first match of `from` in `path`.
    pub fn apply(&self, path: &str) -> String {
        self.from.replace(path, self.to.as_str()).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub key: String,
    /// Normalized host, `None` for any host.
    pub host: Option<String>,
    pub path_prefix: String,
    pub service: String,
    pub ingress_id: String,
    pub project_id: String,
    pub service_id: String,
    pub rewrite: Option<Rewrite>,
    pub matches: Vec<MatchRule>,
}

impl Route {
    /// Compile one entry of the `routes` section.
    pub fn compile(key: &str, spec: &RouteSpec) -> Result<Self, ConfigError> {
        let (host, path) = match key.find('/') {
            Some(idx) => (&key[..idx], &key[idx..]),
            None => (key, "/"),
        };
        let host = normalize_host(host);
        let regex = |pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                route: key.to_string(),
                pattern: pattern.to_string(),
                source,
            })
        };

        let rewrite = match spec.rewrite.as_deref() {
            None | Some([]) => None,
            Some([from, to]) => Some(Rewrite {
                from: regex(from)?,
                to: to.clone(),
            }),
            Some(other) => {
                return Err(ConfigError::InvalidRewrite {
                    route: key.to_string(),
                    len: other.len(),
                })
            }
        };

        let matches = spec
            .matches
            .iter()
            .map(|m| {
                let reg = regex(&m.reg)?;
                Ok(match m.kind {
                    MatchKind::Header => {
                        let name = m
                            .name
                            .as_deref()
                            .filter(|n| !n.is_empty())
                            .ok_or_else(|| ConfigError::MissingHeaderName {
                                route: key.to_string(),
                            })?;
                        MatchRule::Header {
                            name: name.to_ascii_lowercase(),
                            reg,
                        }
                    }
                    MatchKind::Path => MatchRule::Path { reg },
                    MatchKind::Method => MatchRule::Method { reg },
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            key: key.to_string(),
            host: (!host.is_empty()).then_some(host),
            path_prefix: path.to_string(),
            service: spec.service.clone(),
            ingress_id: spec.ingress_id.clone(),
            project_id: spec.project_id.clone(),
            service_id: spec.service_id.clone(),
            rewrite,
            matches,
        })
    }

    fn prefix_matches(&self, path: &str) -> bool {
        let prefix = self.path_prefix.as_str();
        if prefix == "/" || path == prefix {
            return true;
        }
        path.starts_with(prefix)
            && (prefix.ends_with('/') || path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    fn decide(&self, path: &str) -> RouteDecision {
        RouteDecision {
            route_key: self.key.clone(),
            service: self.service.clone(),
            ingress_id: self.ingress_id.clone(),
            project_id: self.project_id.clone(),
            service_id: self.service_id.clone(),
            path: match &self.rewrite {
                Some(rewrite) => rewrite.apply(path),
                None => path.to_string(),
            },
        }
    }
}

/// Result of routing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub route_key: String,
    pub service: String,
    pub ingress_id: String,
    pub project_id: String,
    pub service_id: String,
    /// Path and query to forward upstream, after rewriting.
    pub path: String,
}

#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
    /// Route indices per host, longest prefix first. `None` is any host.
    by_host: HashMap<Option<String>, Vec<usize>>,
    /// Indices of routes with match rules, in declaration order.
    with_rules: Vec<usize>,
}

impl Router {
    pub fn compile(routes: &OrderedMap<RouteSpec>) -> Result<Self, ConfigError> {
        let routes = routes
            .iter()
            .map(|(key, spec)| Route::compile(key, spec))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_routes(routes))
    }

    pub fn from_routes(routes: Vec<Route>) -> Self {
        let mut by_host: HashMap<Option<String>, Vec<usize>> = HashMap::new();
        let mut with_rules = Vec::new();

        for (idx, route) in routes.iter().enumerate() {
            by_host.entry(route.host.clone()).or_default().push(idx);
            if !route.matches.is_empty() {
                with_rules.push(idx);
            }
        }
        for indices in by_host.values_mut() {
            // Stable: equal prefixes keep declaration order.
            indices.sort_by_key(|&idx| std::cmp::Reverse(routes[idx].path_prefix.len()));
        }

        Self {
            routes,
            by_host,
            with_rules,
        }
    }

    /// Route a request. `path` is the raw path and query.
    pub fn route(
        &self,
        host: Option<&str>,
        path: &str,
        headers: &HeaderMap,
        method: &Method,
    ) -> Option<RouteDecision> {
        let host = host.map(normalize_host).filter(|h| !h.is_empty());
        let path_only = path.split('?').next().unwrap_or(path);

        let host_routes = host
            .as_ref()
            .and_then(|h| self.by_host.get(&Some(h.clone())))
            .into_iter()
            .chain(self.by_host.get(&None))
            .flatten();
        for &idx in host_routes {
            let route = &self.routes[idx];
            if route.prefix_matches(path_only) {
                debug!(route = %route.key, service = %route.service, "Route matched by host/path");
                return Some(route.decide(path));
            }
        }

        for &idx in &self.with_rules {
            let route = &self.routes[idx];
            if route.host.is_some() && route.host != host {
                continue;
            }
            if route.matches.iter().any(|m| m.matches(path, headers, method)) {
                debug!(route = %route.key, service = %route.service, "Route matched by rule");
                return Some(route.decide(path));
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
