//! Shared harness for the end-to-end tests.
//!
//! Two mock servers cover both sides of the agent: an origin server the
//! probed requests hit, and an ingest server capturing the gzipped event
//! POSTs. Process-wide state (send queue, probe, environment variables)
//! forces the tests to run one at a time; every test takes [`lock`] and
//! brackets itself with [`reset`].

use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use openwhisk_newrelic_agent::queue;

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests against the process-global queue, probe, and
/// environment.
pub fn lock() -> MutexGuard<'static, ()> {
    match TEST_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tears down process-global state. Called at both ends of every test so
/// a panicked predecessor cannot leak a queue bound to a dead runtime.
pub async fn reset() {
    openwhisk_newrelic_agent::stop_instrument();
    queue::stop().await;
}

/// Environment variables the agent reads; cleared before each test.
const AGENT_ENV_VARS: [&str; 12] = [
    "__OW_ACTION_NAME",
    "__OW_NAMESPACE",
    "__OW_ACTIVATION_ID",
    "__OW_TRANSACTION_ID",
    "__OW_REGION",
    "__OW_CLOUD",
    "__OW_DEADLINE",
    "MESOS_CONTAINER_NAME",
    "DISABLE_ACTION_TIMEOUT_METRIC",
    "OPENWHISK_NEWRELIC_DISABLE_ALL_INSTRUMENTATION",
    "OPENWHISK_NEWRELIC_DISABLE_HTTP_INSTRUMENTATION",
    "NEW_RELIC_SEND_INTERVAL_MS",
];

/// Scoped environment override; restores the previous values on drop.
pub struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    pub fn set(vars: &[(&'static str, &str)]) -> Self {
        let saved = AGENT_ENV_VARS
            .iter()
            .map(|name| (*name, std::env::var(name).ok()))
            .collect();
        for name in AGENT_ENV_VARS {
            std::env::remove_var(name);
        }
        for (name, value) in vars {
            std::env::set_var(name, value);
        }
        EnvGuard { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            match value {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
    }
}

/// One request captured by a mock server.
#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Canned response a [`MockServer`] serves for every request.
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockResponse {
    pub fn json_ok() -> Self {
        MockResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: r#"{"ok":true}"#.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Minimal HTTP server capturing every request it serves.
#[derive(Clone)]
pub struct MockServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockServer {
    /// Starts a server on a random loopback port.
    pub async fn start(response: MockResponse) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock server");
        let addr = listener.local_addr().expect("failed to get local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let captured = Arc::clone(&captured);
                let response = response.clone();

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let captured = Arc::clone(&captured);
                        let response = response.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes().to_vec())
                                .unwrap_or_default();
                            captured
                                .lock()
                                .expect("mock server request log")
                                .push(ReceivedRequest {
                                    method: parts.method.to_string(),
                                    path: parts.uri.path().to_string(),
                                    headers: parts
                                        .headers
                                        .iter()
                                        .map(|(key, value)| {
                                            (
                                                key.to_string(),
                                                value.to_str().unwrap_or("").to_string(),
                                            )
                                        })
                                        .collect(),
                                    body,
                                });

                            let mut builder = Response::builder().status(response.status);
                            for (name, value) in &response.headers {
                                builder = builder.header(name.as_str(), value.as_str());
                            }
                            builder.body(Full::new(Bytes::from(response.body.clone())))
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        MockServer { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests
            .lock()
            .expect("mock server request log")
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("mock server request log").len()
    }
}

pub fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .expect("body should be valid gzip");
    decompressed
}

/// All events delivered to an ingest mock, across all POSTs, in arrival
/// order. Each event is a flat JSON object.
pub fn delivered_events(ingest: &MockServer) -> Vec<BTreeMap<String, serde_json::Value>> {
    ingest
        .requests()
        .iter()
        .flat_map(|request| {
            let decoded = gunzip(&request.body);
            serde_json::from_slice::<Vec<BTreeMap<String, serde_json::Value>>>(&decoded)
                .expect("ingest body should be a JSON array of flat events")
        })
        .collect()
}

/// Polls until `count` events were delivered or the timeout elapses.
pub async fn wait_for_events(ingest: &MockServer, count: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if delivered_events(ingest).len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    delivered_events(ingest).len() >= count
}
