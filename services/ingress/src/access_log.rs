//! Structured access log.
//!
//! Each forwarded request produces one JSON event once its response body
//! ends. Bodies are captured while they stream, up to [`MAX_LOGGED_BODY`]
//! bytes and only for allow-listed media types. Events are queued on a
//! bounded channel and a background task ships them in newline-delimited
//! batches to the configured collector. The request path never waits on
//! shipping: a full queue drops the event.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use flate2::read::{MultiGzDecoder, ZlibDecoder};
use hyper::http::HeaderMap;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::schema::LoggerSpec;

/// Largest body captured into an event.
pub const MAX_LOGGED_BODY: usize = 1024 * 1024;

/// Events per shipped batch.
pub const BATCH_SIZE: usize = 1000;

/// Maximum time an event waits before its batch is shipped.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Events buffered between the request path and the shipper.
pub const QUEUE_CAPACITY: usize = 8192;

/// Media types whose bodies are logged. The empty string covers a missing
/// `Content-Type`.
const LOGGED_CONTENT_TYPES: [&str; 5] = [
    "",
    "text/plain",
    "application/json",
    "application/xml",
    "multipart/form-data",
];

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub method: String,
    pub path: String,
    pub protocol: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseLog {
    pub status: u16,
    pub protocol: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct XParameters {
    pub aid: String,
    pub igid: String,
    pub pid: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEvent {
    pub req: RequestLog,
    pub res: ResponseLog,
    #[serde(rename = "x_parameters")]
    pub x_parameters: XParameters,
    pub instance_name: String,
    /// Milliseconds since the Unix epoch.
    pub req_time: i64,
    pub res_time: i64,
    pub end_time: i64,
    pub req_size: usize,
    pub res_size: usize,
    pub remote_addr: String,
    pub remote_port: u16,
    pub local_addr: String,
    pub local_port: u16,
}

/// Flatten headers for logging; repeated headers are joined with `, `.
pub fn headers_for_log(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        match out.entry(name.as_str().to_string()) {
            Entry::Occupied(mut joined) => {
                let joined = joined.get_mut();
                joined.push_str(", ");
                joined.push_str(&value);
            }
            Entry::Vacant(slot) => {
                slot.insert(value.into_owned());
            }
        }
    }
    out
}

/// Whether bodies of this `Content-Type` are logged. Parameters are ignored.
pub fn is_logged_media_type(content_type: Option<&str>) -> bool {
    let media_type = content_type
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    LOGGED_CONTENT_TYPES.contains(&media_type.as_str())
}

/// Text of a captured body, decompressed per `Content-Encoding`.
pub fn body_text(content_encoding: Option<&str>, captured: &[u8]) -> String {
    let decoded = content_encoding
        .map(|e| e.trim().to_ascii_lowercase())
        .and_then(|encoding| decompress(&encoding, captured));
    let body = decoded.as_deref().unwrap_or(captured);
    let end = body.len().min(MAX_LOGGED_BODY);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn decompress(encoding: &str, captured: &[u8]) -> Option<Vec<u8>> {
    let limit = MAX_LOGGED_BODY as u64;
    let mut out = Vec::new();
    let result = match encoding {
        "gzip" | "x-gzip" => MultiGzDecoder::new(captured)
            .take(limit)
            .read_to_end(&mut out),
        "deflate" => ZlibDecoder::new(captured).take(limit).read_to_end(&mut out),
        _ => return None,
    };
    // A capture cut at the size limit ends mid-stream; keep what decoded.
    match result {
        Ok(_) => Some(out),
        Err(_) if !out.is_empty() => Some(out),
        Err(e) => {
            debug!(encoding, error = %e, "Could not decompress logged body");
            None
        }
    }
}

/// Overrides taken from the process environment.
#[derive(Debug, Clone, Default)]
pub struct LoggerOverrides {
    pub enabled: bool,
    pub url: Option<String>,
    pub authorization: Option<String>,
}

/// Where and how events are shipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogShipping {
    pub url: String,
    pub authorization: Option<String>,
}

impl LogShipping {
    /// Combine the document's logger section with environment overrides.
    /// `None` means access logging is off.
    pub fn resolve(spec: &LoggerSpec, overrides: &LoggerOverrides) -> Option<Self> {
        if !(overrides.enabled || spec.enabled) {
            return None;
        }
        let url = overrides
            .url
            .clone()
            .or_else(|| spec.log_url.clone())
            .filter(|u| !u.is_empty());
        let Some(url) = url else {
            warn!("Access logging enabled without a log URL; disabled");
            return None;
        };
        Some(Self {
            url,
            authorization: overrides
                .authorization
                .clone()
                .or_else(|| spec.authorization.clone())
                .filter(|a| !a.is_empty()),
        })
    }
}

/// Handle used by the request path to emit events.
#[derive(Debug, Clone, Default)]
pub struct AccessLogger {
    tx: Option<mpsc::Sender<String>>,
}

impl AccessLogger {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A logger whose events are delivered to the returned receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Start the shipping task. Must be called within a tokio runtime.
    pub fn spawn(shipping: LogShipping) -> Self {
        let (logger, rx) = Self::channel(QUEUE_CAPACITY);
        info!(url = %shipping.url, "Access log shipping enabled");
        tokio::spawn(ship(rx, reqwest::Client::new(), shipping));
        logger
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event. Never blocks.
    pub fn log(&self, event: &AccessLogEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        let mut line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode access log event");
                return;
            }
        };
        line.push('\n');
        if let Err(e) = tx.try_send(line) {
            debug!(error = %e, "Access log event dropped");
        }
    }
}

async fn ship(mut rx: mpsc::Receiver<String>, client: reqwest::Client, shipping: LogShipping) {
    let mut batch: Vec<String> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= BATCH_SIZE {
                        flush(&client, &shipping, &mut batch).await;
                    }
                }
                None => {
                    flush(&client, &shipping, &mut batch).await;
                    debug!("Access log channel closed, shipper exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                flush(&client, &shipping, &mut batch).await;
            }
        }
    }
}

async fn flush(client: &reqwest::Client, shipping: &LogShipping, batch: &mut Vec<String>) {
    if batch.is_empty() {
        return;
    }
    let events = batch.len();
    let body = batch.concat();
    batch.clear();

    let mut request = client
        .post(&shipping.url)
        .header(CONTENT_TYPE, "application/json")
        .body(body);
    if let Some(authorization) = &shipping.authorization {
        request = request.header(AUTHORIZATION, authorization);
    }

    match request.send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!(events, "Shipped access log batch");
        }
        Ok(resp) => {
            warn!(events, status = %resp.status(), "Log collector rejected batch; dropped");
        }
        Err(e) => {
            warn!(events, error = %e, "Failed to ship access log batch; dropped");
        }
    }
}
