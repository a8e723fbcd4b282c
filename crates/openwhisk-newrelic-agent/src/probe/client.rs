//! Instrumented HTTP client.
//!
//! The client owns the whole exchange for each request: DNS resolution,
//! TCP connect, optional TLS handshake, and HTTP/1.1 dispatch over
//! hyper's connection-level API. Owning every step is what makes every
//! lifecycle anchor observable. Responses are buffered before they are returned, so the
//! response-end anchor and the body byte count are always known by the
//! time the metric record emits.
//!
//! One connection is established per request. There is no pool, so the
//! socket-available anchor coincides with the start of connection
//! establishment and the blocked duration stays near zero.

use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::error::HttpError;
use crate::probe::options::RequestOptions;
use crate::probe::timings::{IoAnchors, TimedIo};
use crate::probe::{self, HttpRequestMetrics, ResponseInfo};
use crate::AGENT_USER_AGENT;

/// Response headers checked for a server-side request correlation id.
const REQUEST_ID_HEADERS: [&str; 2] = ["x-request-id", "x-correlation-id"];

static TLS_CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();

fn tls_config() -> Arc<rustls::ClientConfig> {
    Arc::clone(TLS_CONFIG.get_or_init(|| {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }))
}

/// HTTP/HTTPS client observed by the probe.
///
/// Requests dispatched through this client produce one metric record each
/// while the probe is installed. Requests carrying the agent's own ingest
/// user-agent are never observed.
#[derive(Debug, Clone, Default)]
pub struct HttpClient {
    timeout: Option<Duration>,
}

impl HttpClient {
    #[must_use]
    pub fn new() -> Self {
        HttpClient { timeout: None }
    }

    /// Caps the whole exchange. An elapsed timeout fails the request and
    /// produces a record with `errorCode` 110.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Convenience GET.
    pub async fn get(&self, url: &str) -> Result<Response<Bytes>, HttpError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Bytes::new())?;
        self.request(request).await
    }

    /// Convenience POST with a body.
    pub async fn post(&self, url: &str, body: Bytes) -> Result<Response<Bytes>, HttpError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(body)?;
        self.request(request).await
    }

    /// Dispatches a prepared request, observing its full lifecycle.
    pub async fn request(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
        let options = RequestOptions::from_request(&request)?;

        // Loop-breaker: never observe the agent's own ingest uploads.
        let own_upload = request
            .headers()
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            == Some(AGENT_USER_AGENT);
        let callback = if own_upload {
            None
        } else {
            probe::installed_callback()
        };

        let mut record = HttpRequestMetrics::new(options);
        let anchors = Arc::new(Mutex::new(IoAnchors::default()));

        let exchange = Self::exchange(request, &mut record, Arc::clone(&anchors));
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HttpError::TimedOut),
            },
            None => exchange.await,
        };

        let snapshot = match anchors.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        record.timings.request_finished = snapshot.last_write;
        record.timings.first_byte = snapshot.first_read;

        match outcome {
            Ok(response) => {
                if let Some(callback) = &callback {
                    record.emit(callback);
                }
                Ok(response)
            }
            Err(error) => {
                record.record_error(&error);
                if let Some(callback) = &callback {
                    record.emit(callback);
                }
                Err(error)
            }
        }
    }

    async fn exchange(
        request: Request<Bytes>,
        record: &mut HttpRequestMetrics,
        anchors: Arc<Mutex<IoAnchors>>,
    ) -> Result<Response<Bytes>, HttpError> {
        let host = record.options.host.clone();
        let port = record.options.port;
        let https = record.options.is_https();

        record.timings.socket_available = Some(Instant::now());

        let mut addresses =
            lookup_host((host.as_str(), port))
                .await
                .map_err(|source| HttpError::Dns {
                    host: host.clone(),
                    source,
                })?;
        record.timings.dns_lookup = Some(Instant::now());
        let address = addresses.next().ok_or_else(|| HttpError::Dns {
            host: host.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "lookup returned no addresses"),
        })?;

        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| HttpError::Connect {
                addr: address.to_string(),
                source,
            })?;
        record.timings.tcp_connected = Some(Instant::now());
        record.local_ip = stream.local_addr().ok().map(|addr| addr.ip());
        record.server_ip = stream.peer_addr().ok().map(|addr| addr.ip());

        let prepared = Self::prepare(request, record)?;

        let response = if https {
            let server_name = ServerName::try_from(host.clone()).map_err(|error| HttpError::Tls {
                host: host.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, error),
            })?;
            let connector = tokio_rustls::TlsConnector::from(tls_config());
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|source| HttpError::Tls {
                    host: host.clone(),
                    source,
                })?;
            record.timings.tls_handshaken = Some(Instant::now());
            Self::send(tls, prepared, anchors).await?
        } else {
            Self::send(stream, prepared, anchors).await?
        };

        let (parts, body) = response.into_parts();
        let content_length = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let collected = collect_body(body).await?;
        record.timings.response_end = Some(Instant::now());

        record.response = Some(ResponseInfo {
            status: parts.status.as_u16(),
            status_text: parts.status.canonical_reason(),
            content_type: parts
                .headers
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            server_request_id: server_request_id(&parts.headers),
            // The header value wins; counted bytes cover chunked bodies.
            body_size: content_length.unwrap_or(collected.len() as u64),
        });

        Ok(Response::from_parts(parts, collected))
    }

    /// Rewrites the request for hyper's connection-level client: an
    /// origin-form URI and an explicit `Host` header. Also counts the
    /// outgoing body bytes.
    fn prepare(
        request: Request<Bytes>,
        record: &mut HttpRequestMetrics,
    ) -> Result<Request<Full<Bytes>>, HttpError> {
        let (mut parts, body) = request.into_parts();
        record.request_body_size = body.len() as u64;

        parts.uri = record
            .options
            .path
            .parse::<Uri>()
            .map_err(|error| HttpError::InvalidUri(error.to_string()))?;
        if !parts.headers.contains_key(HOST) {
            let value = HeaderValue::from_str(&record.options.host_header())
                .map_err(|error| HttpError::InvalidUri(error.to_string()))?;
            parts.headers.insert(HOST, value);
        }
        Ok(Request::from_parts(parts, Full::new(body)))
    }

    async fn send<S>(
        io: S,
        request: Request<Full<Bytes>>,
        anchors: Arc<Mutex<IoAnchors>>,
    ) -> Result<Response<Incoming>, HttpError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let timed = TimedIo::new(io, anchors);
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(timed)).await?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!("http connection task ended: {error}");
            }
        });
        Ok(sender.send_request(request).await?)
    }
}

async fn collect_body(mut body: Incoming) -> Result<Bytes, HttpError> {
    let mut collected = BytesMut::new();
    while let Some(next) = body.frame().await {
        let frame = next?;
        if let Ok(data) = frame.into_data() {
            collected.extend_from_slice(&data);
        }
    }
    Ok(collected.freeze())
}

fn server_request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    })
}
