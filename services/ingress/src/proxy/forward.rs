//! Request forwarding pipeline.
//!
//! Serves HTTP/1.1 on an accepted (plain or TLS) connection and runs every
//! request through: plain-HTTP rejection, routing, target selection,
//! forwarding, then metrics and access logging.
//!
//! Bodies are streamed in both directions. The access log event for a
//! request is emitted when its response body has been sent.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::access_log::{
    body_text, headers_for_log, is_logged_media_type, AccessLogEvent, AccessLogger, RequestLog,
    ResponseLog, XParameters,
};
use crate::error::ForwardError;
use crate::metrics::Metrics;
use crate::proxy::balancer::{Service, Target};
use crate::proxy::body::{lock, Capture, SharedCapture, TappedBody};
use crate::proxy::pool::{try_send, ConnectionPool, SendError, DEFAULT_CONNECT_TIMEOUT};
use crate::proxy::router::RouteDecision;
use crate::proxy::session::ConnectionContext;
use crate::state::{GatewayState, SharedState};

/// Body type used on both sides of the proxy.
pub type Body = BoxBody<Bytes, hyper::Error>;

/// Default time a client gets to send a complete request head.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection-scoped headers that are not forwarded.
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// A complete in-memory body.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(full(status.canonical_reason().unwrap_or("")));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Addresses of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    /// Client address.
    pub peer_addr: SocketAddr,
    /// Listener address the client connected to.
    pub local_addr: SocketAddr,
    /// Whether the connection arrived over terminated TLS.
    pub tls: bool,
}

/// Shared handles for every connection of every listener.
#[derive(Debug)]
pub struct Pipeline {
    state: Arc<SharedState>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<Metrics>,
    access_log: AccessLogger,
    instance_name: String,
    connect_timeout: Duration,
    header_read_timeout: Duration,
}

impl Pipeline {
    /// Create a pipeline over `state` with its own upstream slot pool.
    pub fn new(state: Arc<SharedState>, metrics: Arc<Metrics>, access_log: AccessLogger) -> Self {
        Self {
            state,
            pool: Arc::new(ConnectionPool::new()),
            metrics,
            access_log,
            instance_name: String::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }

    /// Name reported as `instanceName` in access log events.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Timeout for opening an upstream connection.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Time a client gets to send a complete request head before the
    /// connection is closed.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    /// The published gateway state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Upstream slot bookkeeping.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Serve HTTP/1.1 on `stream` until the client goes away.
    ///
    /// `snapshot` is used for every request on the connection, so a reload
    /// only affects connections accepted after it.
    pub async fn serve<S>(
        self: &Arc<Self>,
        stream: S,
        conn: ConnectionInfo,
        snapshot: Arc<GatewayState>,
    ) -> Result<(), hyper::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = Arc::new(Mutex::new(ConnectionContext::new(Arc::clone(&self.pool))));
        let pipeline = Arc::clone(self);

        let service = service_fn(move |req: Request<Incoming>| {
            let pipeline = Arc::clone(&pipeline);
            let ctx = Arc::clone(&ctx);
            let snapshot = Arc::clone(&snapshot);
            async move {
                let mut ctx = ctx.lock().await;
                Ok::<_, Infallible>(pipeline.handle(req, &snapshot, &mut ctx, conn).await)
            }
        });

        http1::Builder::new()
            .keep_alive(true)
            .timer(TokioTimer::new())
            .header_read_timeout(self.header_read_timeout)
            .serve_connection(TokioIo::new(stream), service)
            .await
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        state: &GatewayState,
        ctx: &mut ConnectionContext,
        conn: ConnectionInfo,
    ) -> Response<Body> {
        let started = Instant::now();
        let req_time = Utc::now().timestamp_millis();
        let host = request_host(&req);

        if !conn.tls {
            if let Some(host) = host.as_deref().filter(|h| state.certificates.is_tls_host(h)) {
                debug!(host, "Plain HTTP request for TLS-only host");
                return status_response(StatusCode::FORBIDDEN);
            }
        }

        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/")
            .to_string();
        let Some(decision) = state
            .router
            .route(host.as_deref(), &path, req.headers(), req.method())
        else {
            debug!(host = ?host, path = %path, "No route matched");
            return status_response(StatusCode::NOT_FOUND);
        };
        self.metrics.record_route(&decision);

        let Some(service) = state.services.get(&decision.service) else {
            warn!(service = %decision.service, route = %decision.route_key, "Route points at unknown service");
            return status_response(StatusCode::BAD_GATEWAY);
        };

        let sticky_key = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(selection) = ctx.select(service, sticky_key.as_deref()) else {
            warn!(service = %service.name, "Service has no targets");
            return status_response(StatusCode::BAD_GATEWAY);
        };
        let target = selection.target().clone();

        let (mut parts, body) = req.into_parts();
        parts.uri = match Uri::try_from(decision.path.as_str()) {
            Ok(uri) => uri,
            Err(e) => {
                debug!(path = %decision.path, error = %e, "Rewritten path is not a valid URI");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };
        strip_hop_by_hop(&mut parts.headers);
        if let Ok(value) = HeaderValue::from_str(&target.host) {
            parts.headers.insert(header::HOST, value);
        }

        let request_log = self.access_log.is_enabled().then(|| PendingLog {
            req: RequestLog {
                method: parts.method.to_string(),
                path: decision.path.clone(),
                protocol: format!("{:?}", parts.version),
                headers: headers_for_log(&parts.headers),
                body: String::new(),
            },
            req_encoding: content_encoding(&parts.headers),
            req_capture: Capture::shared(is_logged_media_type(content_type(&parts.headers))),
        });
        let mut body = TappedBody::new(body.boxed());
        if let Some(pending) = &request_log {
            body = body.capture(Arc::clone(&pending.req_capture));
        }
        let method = parts.method.clone();

        let upstream = match self
            .forward(ctx, &target, service, Request::from_parts(parts, body.boxed()))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(service = %service.name, target = %target, error = %e, "Upstream request failed");
                ctx.discard(&target);
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };
        let res_time = Utc::now().timestamp_millis();

        let (mut parts, body) = upstream.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        self.metrics.record_response(
            method.as_str(),
            parts.status.as_u16(),
            &target.host,
            &decision.path,
            started.elapsed(),
        );
        debug!(
            service = %service.name,
            target = %target,
            status = parts.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request forwarded"
        );

        let mut body = TappedBody::new(body.boxed()).hold(selection.into_lease());
        if let Some(pending) = request_log {
            let res_capture = Capture::shared(is_logged_media_type(content_type(&parts.headers)));
            let res = ResponseLog {
                status: parts.status.as_u16(),
                protocol: format!("{:?}", parts.version),
                headers: headers_for_log(&parts.headers),
                body: String::new(),
            };
            let res_encoding = content_encoding(&parts.headers);
            let event = AccessLogEvent {
                req: pending.req,
                res,
                x_parameters: x_parameters(&decision),
                instance_name: self.instance_name.clone(),
                req_time,
                res_time,
                end_time: res_time,
                req_size: 0,
                res_size: 0,
                remote_addr: conn.peer_addr.ip().to_string(),
                remote_port: conn.peer_addr.port(),
                local_addr: conn.local_addr.ip().to_string(),
                local_port: conn.local_addr.port(),
            };
            let logger = self.access_log.clone();
            let req_capture = pending.req_capture;
            let req_encoding = pending.req_encoding;
            body = body
                .capture(Arc::clone(&res_capture))
                .on_complete(move || {
                    let mut event = event;
                    let req = lock(&req_capture);
                    let res = lock(&res_capture);
                    event.req.body = body_text(req_encoding.as_deref(), req.bytes());
                    event.req_size = req.size();
                    event.res.body = body_text(res_encoding.as_deref(), res.bytes());
                    event.res_size = res.size();
                    event.end_time = Utc::now().timestamp_millis();
                    logger.log(&event);
                });
        }

        Response::from_parts(parts, body.boxed())
    }

    /// Send `request` to `target`, reusing the connection's cached upstream.
    /// A cached connection that closed before the request went out is
    /// replaced once.
    async fn forward(
        &self,
        ctx: &mut ConnectionContext,
        target: &Target,
        service: &Service,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let tls = service.upstream.as_ref();
        let sender = ctx.sender(target, tls, self.connect_timeout).await?;
        let request = match try_send(sender, request).await {
            Ok(response) => return Ok(response),
            Err(SendError::Failed(e)) => return Err(e.into()),
            Err(SendError::Unsent(request, e)) => {
                debug!(target = %target, error = %e, "Upstream connection closed before use; redialing");
                request
            }
        };

        let sender = ctx.redial(target, tls, self.connect_timeout).await?;
        match try_send(sender, request).await {
            Ok(response) => Ok(response),
            Err(SendError::Unsent(_, e) | SendError::Failed(e)) => Err(e.into()),
        }
    }
}

/// Request-side half of an access log event, completed when the response
/// body ends.
struct PendingLog {
    req: RequestLog,
    req_encoding: Option<String>,
    req_capture: SharedCapture,
}

fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .map(str::to_string)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

fn content_encoding(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

fn x_parameters(decision: &RouteDecision) -> XParameters {
    XParameters {
        aid: decision.service_id.clone(),
        igid: decision.ingress_id.clone(),
        pid: decision.project_id.clone(),
    }
}
