//! Streaming body adapter.
//!
//! [`TappedBody`] passes frames through untouched. Along the way it counts
//! bytes, optionally copies a bounded prefix for the access log and keeps a
//! balancer [`Lease`] alive. When the stream ends, errors or is dropped, the
//! lease is released and the completion hook runs exactly once.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body as HttpBody, Frame, SizeHint};

use crate::access_log::MAX_LOGGED_BODY;
use crate::proxy::balancer::Lease;
use crate::proxy::forward::Body;

/// Byte count and logged prefix of one body.
#[derive(Debug, Default)]
pub struct Capture {
    keep: bool,
    bytes: Vec<u8>,
    size: usize,
}

/// A [`Capture`] written by the body and read by the completion hook.
pub type SharedCapture = Arc<Mutex<Capture>>;

impl Capture {
    /// `keep` decides whether bytes are copied or only counted.
    pub fn shared(keep: bool) -> SharedCapture {
        Arc::new(Mutex::new(Self {
            keep,
            ..Self::default()
        }))
    }

    fn record(&mut self, chunk: &[u8]) {
        self.size += chunk.len();
        if self.keep && self.bytes.len() < MAX_LOGGED_BODY {
            let room = MAX_LOGGED_BODY - self.bytes.len();
            self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    /// Total bytes seen so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copied prefix, at most [`MAX_LOGGED_BODY`] bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Lock a capture, ignoring poisoning.
pub fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

type OnComplete = Box<dyn FnOnce() + Send + Sync>;

/// A body that observes the frames it forwards.
pub struct TappedBody {
    inner: Body,
    capture: Option<SharedCapture>,
    lease: Option<Lease>,
    on_complete: Option<OnComplete>,
}

impl TappedBody {
    pub fn new(inner: Body) -> Self {
        Self {
            inner,
            capture: None,
            lease: None,
            on_complete: None,
        }
    }

    /// Record data frames into `capture`.
    pub fn capture(mut self, capture: SharedCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Keep `lease` until the body completes.
    pub fn hold(mut self, lease: Option<Lease>) -> Self {
        self.lease = lease;
        self
    }

    /// Run `f` once the body completes.
    pub fn on_complete(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    fn complete(&mut self) {
        self.lease = None;
        if let Some(f) = self.on_complete.take() {
            f();
        }
    }
}

impl HttpBody for TappedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(capture)) = (frame.data_ref(), &this.capture) {
                    lock(capture).record(data);
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TappedBody {
    fn drop(&mut self) {
        self.complete();
    }
}
