//! Request metrics.
//!
//! Counters keyed by label values and a fixed-bucket latency histogram,
//! rendered in the Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

use crate::proxy::router::RouteDecision;

/// Latency bucket upper bounds in milliseconds; `+Inf` is implicit.
pub const LATENCY_BUCKETS_MS: [u64; 26] = [
    1, 2, 5, 7, 10, 15, 20, 25, 30, 40, 50, 60, 70, 80, 90, 100, 200, 300, 400, 500, 1000, 2000,
    5000, 10000, 30000, 60000,
];

/// A counter with a fixed label set.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    values: DashMap<Vec<String>, AtomicU64>,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self {
            name,
            help,
            labels,
            values: DashMap::new(),
        }
    }

    pub fn increment(&self, values: &[&str]) {
        debug_assert_eq!(values.len(), self.labels.len());
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        if let Some(counter) = self.values.get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.values
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Current value for a label set (0 if never incremented).
    pub fn get(&self, values: &[&str]) -> u64 {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.values
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label set.
    pub fn total(&self) -> u64 {
        self.values
            .iter()
            .map(|e| e.value().load(Ordering::Relaxed))
            .sum()
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);

        let mut rows: Vec<(String, u64)> = self
            .values
            .iter()
            .map(|e| (render_labels(self.labels, e.key()), e.value().load(Ordering::Relaxed)))
            .collect();
        rows.sort();
        for (labels, value) in rows {
            let _ = writeln!(out, "{}{{{}}} {}", self.name, labels, value);
        }
    }
}

/// Latency histogram over [`LATENCY_BUCKETS_MS`].
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    /// Non-cumulative counts; the last slot is `+Inf`.
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            buckets: (0..=LATENCY_BUCKETS_MS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());

        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Cumulative count of observations `<= bound_ms`.
    pub fn cumulative(&self, bound_ms: u64) -> u64 {
        LATENCY_BUCKETS_MS
            .iter()
            .zip(&self.buckets)
            .take_while(|(bound, _)| **bound <= bound_ms)
            .map(|(_, count)| count.load(Ordering::Relaxed))
            .sum()
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} histogram", self.name);

        let mut cumulative = 0u64;
        for (bound, count) in LATENCY_BUCKETS_MS.iter().zip(&self.buckets) {
            cumulative += count.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, cumulative);
        }
        cumulative += self.buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, cumulative);
        let _ = writeln!(out, "{}_sum {}", self.name, self.sum_ms.load(Ordering::Relaxed));
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Gateway metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub requests: Counter,
    pub latency: Histogram,
    pub service_requests: Counter,
    pub ingress_requests: Counter,
    pub project_requests: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests: Counter::new(
                "http_requests_count",
                "Completed forwarded requests",
                &["method", "status", "host", "path"],
            ),
            latency: Histogram::new(
                "http_request_latency",
                "Time from request to response in milliseconds",
            ),
            service_requests: Counter::new(
                "req_service_cnt",
                "Routed requests per service",
                &["serviceid"],
            ),
            ingress_requests: Counter::new(
                "req_ingress_cnt",
                "Routed requests per ingress",
                &["ingressid"],
            ),
            project_requests: Counter::new(
                "req_project_cnt",
                "Routed requests per project",
                &["projectid"],
            ),
        }
    }

    /// Count a routed request.
    pub fn record_route(&self, decision: &RouteDecision) {
        self.service_requests.increment(&[decision.service.as_str()]);
        self.ingress_requests.increment(&[decision.ingress_id.as_str()]);
        self.project_requests.increment(&[decision.project_id.as_str()]);
    }

    /// Count a completed forwarded request.
    pub fn record_response(
        &self,
        method: &str,
        status: u16,
        host: &str,
        path: &str,
        elapsed: Duration,
    ) {
        let status = status.to_string();
        self.requests.increment(&[method, status.as_str(), host, path]);
        self.latency.observe(elapsed);
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.requests.render(&mut out);
        self.latency.render(&mut out);
        self.service_requests.render(&mut out);
        self.ingress_requests.render(&mut out);
        self.project_requests.render(&mut out);
        out
    }
}

fn render_labels(names: &[&str], values: &[String]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, escape_label(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}
