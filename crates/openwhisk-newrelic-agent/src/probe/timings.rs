//! Timing anchors for one outgoing request.
//!
//! Nine monotonic anchors are recorded over a request's lifetime; every
//! reported duration is a delta between two of them and is omitted (not
//! zeroed) when either endpoint is missing. The send/first-byte anchors
//! come from [`TimedIo`], an `AsyncRead`/`AsyncWrite` wrapper placed
//! under the HTTP connection: the last socket write before the first
//! read marks the request as fully written, the first non-empty read
//! marks the first response byte on the wire.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::metrics::{MetricMap, MetricValue};

/// Anchor points over one request's lifetime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestTimings {
    pub start: Instant,
    pub socket_available: Option<Instant>,
    pub dns_lookup: Option<Instant>,
    pub tcp_connected: Option<Instant>,
    pub tls_handshaken: Option<Instant>,
    pub request_finished: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub response_end: Option<Instant>,
    pub error_at: Option<Instant>,
}

impl RequestTimings {
    pub(crate) fn new() -> Self {
        RequestTimings {
            start: Instant::now(),
            socket_available: None,
            dns_lookup: None,
            tcp_connected: None,
            tls_handshaken: None,
            first_byte: None,
            request_finished: None,
            response_end: None,
            error_at: None,
        }
    }

    /// Writes the duration attributes into an event.
    pub(crate) fn add_duration_metrics(&self, event: &mut MetricMap) {
        let end = match (self.error_at, self.response_end) {
            (Some(error_at), Some(response_end)) => Some(error_at.min(response_end)),
            (error_at, response_end) => error_at.or(response_end),
        };

        insert_delta(event, "duration", Some(self.start), end);
        insert_delta(
            event,
            "durationBlocked",
            Some(self.start),
            self.socket_available,
        );
        insert_delta(event, "durationDNS", self.socket_available, self.dns_lookup);
        insert_delta(
            event,
            "durationConnect",
            self.dns_lookup.or(self.socket_available),
            self.tcp_connected,
        );
        insert_delta(event, "durationSSL", self.tcp_connected, self.tls_handshaken);
        insert_delta(
            event,
            "durationSend",
            self.tls_handshaken.or(self.tcp_connected),
            self.request_finished,
        );
        insert_delta(
            event,
            "durationWait",
            self.request_finished,
            self.first_byte,
        );
        insert_delta(
            event,
            "durationReceive",
            self.first_byte,
            self.response_end,
        );
    }
}

fn insert_delta(event: &mut MetricMap, key: &str, from: Option<Instant>, to: Option<Instant>) {
    if let (Some(from), Some(to)) = (from, to) {
        let millis = to.saturating_duration_since(from).as_secs_f64() * 1000.0;
        event.insert(key.to_string(), MetricValue::Float(millis));
    }
}

/// Wire-level anchors shared with the connection task.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IoAnchors {
    /// Last successful socket write before the first read.
    pub last_write: Option<Instant>,
    /// First read that produced bytes.
    pub first_read: Option<Instant>,
}

/// Transparent IO wrapper recording [`IoAnchors`].
pub(crate) struct TimedIo<S> {
    inner: S,
    anchors: Arc<Mutex<IoAnchors>>,
}

impl<S> TimedIo<S> {
    pub(crate) fn new(inner: S, anchors: Arc<Mutex<IoAnchors>>) -> Self {
        TimedIo { inner, anchors }
    }

    fn with_anchors(&self, update: impl FnOnce(&mut IoAnchors)) {
        let mut guard = match self.anchors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(&mut guard);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled_before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > filled_before {
            this.with_anchors(|anchors| {
                if anchors.first_read.is_none() {
                    anchors.first_read = Some(Instant::now());
                }
            });
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &result {
            if *written > 0 {
                this.with_anchors(|anchors| {
                    // Writes after the first response byte belong to a later
                    // exchange on the connection, not to this request.
                    if anchors.first_read.is_none() {
                        anchors.last_write = Some(Instant::now());
                    }
                });
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
