//! Error types for the metrics agent.
//!
//! All failures local to metrics collection are recovered at their origin
//! and logged; none propagate into action code. The only path that returns
//! errors to a caller is the immediate-mode send, and even there the agent
//! façade logs and swallows by default.

use thiserror::Error;

use crate::metrics::flatten::FlattenError;

/// Errors raised by the agent and the send queue.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Agent construction was handed a blank URL or API key.
    #[error("invalid agent configuration: {0}")]
    Config(String),

    /// An event could not be flattened for the ingest payload.
    #[error(transparent)]
    Flatten(#[from] FlattenError),

    /// The ingest endpoint answered with a non-success status.
    #[error("metrics ingest returned status {status}: {body}")]
    IngestStatus { status: u16, body: String },

    /// The ingest POST failed before a response arrived.
    #[error("failed to send metrics batch: {0}")]
    Transport(#[from] reqwest::Error),

    /// The payload could not be serialized to JSON.
    #[error("failed to encode metrics payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Gzip compression of the payload failed.
    #[error("failed to compress metrics payload: {0}")]
    Compress(#[from] std::io::Error),

    /// The send queue has been stopped or never started.
    #[error("send queue is not running")]
    QueueUnavailable,
}

/// Errors raised by the instrumented HTTP client.
///
/// These surface to the caller of the probed request; the metric record
/// for the failed request is emitted regardless.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request URI lacked a usable scheme or authority.
    #[error("invalid request URI: {0}")]
    InvalidUri(String),

    /// DNS resolution failed or returned no addresses.
    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The TCP connection could not be established.
    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The TLS handshake failed.
    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP exchange failed after the connection was up.
    #[error("HTTP exchange failed: {0}")]
    Protocol(#[from] hyper::Error),

    /// The request could not be constructed.
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    /// The configured per-request timeout elapsed.
    #[error("Connection timed out")]
    TimedOut,
}

/// `ETIMEDOUT`, reported as `errorCode` on request timeouts.
pub(crate) const ETIMEDOUT: i64 = 110;

impl HttpError {
    /// Numeric error code carried on the metric record, when one applies.
    #[must_use]
    pub(crate) fn error_code(&self) -> Option<i64> {
        match self {
            HttpError::TimedOut => Some(ETIMEDOUT),
            HttpError::Dns { source, .. }
            | HttpError::Connect { source, .. }
            | HttpError::Tls { source, .. } => source.raw_os_error().map(i64::from),
            _ => None,
        }
    }
}
