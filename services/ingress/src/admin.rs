//! Prometheus scrape endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::metrics::Metrics;
use crate::proxy::forward::{full, Body};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

fn respond(req: &Request<Incoming>, metrics: &Metrics) -> Response<Body> {
    if req.method() != Method::GET || req.uri().path() != "/metrics" {
        let mut response = Response::new(full("Not Found"));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let mut response = Response::new(full(metrics.render()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    response
}

/// Serve `GET /metrics` on `listener` until the task is dropped.
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<Metrics>) {
    if let Ok(addr) = listener.local_addr() {
        info!(bind_addr = %addr, "Metrics endpoint started");
    }

    loop {
        let (stream, peer_addr): (_, SocketAddr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Metrics accept error");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = respond(&req, &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer_addr = %peer_addr, error = %e, "Metrics connection error");
            }
        });
    }
}
