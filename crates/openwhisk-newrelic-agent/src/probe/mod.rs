//! HTTP client probe.
//!
//! The probe observes outgoing HTTP/HTTPS requests and produces one
//! normalized metric record per completed or failed request, without
//! altering request semantics. Rust offers no patchable process-global
//! request function, so the observable entry point is [`client::HttpClient`],
//! a transport that stdlib-style callers construct; installation state is
//! still process-global so `instrument`/`stop_instrument` keep their
//! install-once/restore semantics.
//!
//! # Installation
//!
//! [`start`] installs the metrics callback (first caller wins, re-entry is
//! a no-op); [`stop`] removes it (idempotent). Requests dispatched while
//! the probe is installed capture the callback at dispatch time, so
//! records for in-flight requests still emit after a `stop`.

pub mod client;
pub mod options;
pub(crate) mod timings;

use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, error};

use crate::error::HttpError;
use crate::metrics::{MetricMap, MetricValue};
use self::options::RequestOptions;
use self::timings::RequestTimings;

/// Callback receiving one finished metric record per observed request.
pub type MetricsCallback = Arc<dyn Fn(MetricMap) + Send + Sync>;

static PROBE: OnceLock<RwLock<Option<MetricsCallback>>> = OnceLock::new();

fn probe_cell() -> &'static RwLock<Option<MetricsCallback>> {
    PROBE.get_or_init(|| RwLock::new(None))
}

/// Installs the probe callback.
///
/// Returns `true` when this call performed the installation; a second
/// caller's callback is ignored and `false` is returned.
pub fn start(callback: MetricsCallback) -> bool {
    let mut guard = match probe_cell().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_some() {
        debug!("http probe already installed, ignoring start");
        return false;
    }
    *guard = Some(callback);
    debug!("http probe installed");
    true
}

/// Uninstalls the probe. Idempotent; in-flight requests keep the
/// callback they captured at dispatch time.
pub fn stop() {
    let mut guard = match probe_cell().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.take().is_some() {
        debug!("http probe uninstalled");
    }
}

/// Whether a probe callback is currently installed.
#[must_use]
pub fn is_installed() -> bool {
    match probe_cell().read() {
        Ok(guard) => guard.is_some(),
        Err(poisoned) => poisoned.into_inner().is_some(),
    }
}

/// Snapshot of the installed callback, captured per request.
pub(crate) fn installed_callback() -> Option<MetricsCallback> {
    match probe_cell().read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Response attributes captured from the head and body of the exchange.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseInfo {
    pub status: u16,
    pub status_text: Option<&'static str>,
    pub content_type: Option<String>,
    pub server_request_id: Option<String>,
    pub body_size: u64,
}

/// Everything known about one observed request, accumulated over its
/// lifetime and emitted exactly once.
pub(crate) struct HttpRequestMetrics {
    pub options: RequestOptions,
    pub timings: RequestTimings,
    pub request_body_size: u64,
    pub local_ip: Option<IpAddr>,
    pub server_ip: Option<IpAddr>,
    pub response: Option<ResponseInfo>,
    error_message: Option<String>,
    error_code: Option<i64>,
    emitted: bool,
}

impl HttpRequestMetrics {
    pub(crate) fn new(options: RequestOptions) -> Self {
        HttpRequestMetrics {
            options,
            timings: RequestTimings::new(),
            request_body_size: 0,
            local_ip: None,
            server_ip: None,
            response: None,
            error_message: None,
            error_code: None,
            emitted: false,
        }
    }

    /// Records a failed outcome. The record still emits afterwards.
    pub(crate) fn record_error(&mut self, error: &HttpError) {
        self.timings.error_at = Some(std::time::Instant::now());
        self.error_message = Some(error.to_string());
        self.error_code = error.error_code();
    }

    /// Builds the metric record from its four slices: request, response,
    /// timing, and error attributes.
    pub(crate) fn to_event(&self) -> MetricMap {
        let mut event = MetricMap::new();

        // Request attributes.
        event.insert(
            "protocol".to_string(),
            MetricValue::Str(self.options.protocol.clone()),
        );
        event.insert("host".to_string(), MetricValue::Str(self.options.host.clone()));
        event.insert("port".to_string(), MetricValue::Int(i64::from(self.options.port)));
        event.insert("path".to_string(), MetricValue::Str(self.options.path.clone()));
        event.insert("url".to_string(), MetricValue::Str(self.options.url()));
        event.insert(
            "method".to_string(),
            MetricValue::Str(self.options.method.clone()),
        );
        event.insert("domain".to_string(), MetricValue::Str(self.options.domain()));
        event.insert(
            "requestBodySize".to_string(),
            MetricValue::from(self.request_body_size),
        );

        // Response attributes.
        if let Some(response) = &self.response {
            event.insert(
                "responseCode".to_string(),
                MetricValue::Int(i64::from(response.status)),
            );
            if let Some(status_text) = response.status_text {
                event.insert(
                    "responseStatus".to_string(),
                    MetricValue::Str(status_text.to_string()),
                );
            }
            if let Some(content_type) = &response.content_type {
                event.insert(
                    "contentType".to_string(),
                    MetricValue::Str(content_type.clone()),
                );
            }
            if let Some(id) = &response.server_request_id {
                event.insert("serverRequestId".to_string(), MetricValue::Str(id.clone()));
            }
            event.insert(
                "responseBodySize".to_string(),
                MetricValue::from(response.body_size),
            );
        }
        if let Some(local_ip) = self.local_ip {
            event.insert(
                "localIPAddress".to_string(),
                MetricValue::Str(local_ip.to_string()),
            );
        }
        if let Some(server_ip) = self.server_ip {
            event.insert(
                "serverIPAddress".to_string(),
                MetricValue::Str(server_ip.to_string()),
            );
        }

        // Timing attributes.
        self.timings.add_duration_metrics(&mut event);

        // Error attributes.
        if let Some(message) = &self.error_message {
            event.insert("error".to_string(), MetricValue::Bool(true));
            event.insert("errorMessage".to_string(), MetricValue::Str(message.clone()));
            if let Some(code) = self.error_code {
                event.insert("errorCode".to_string(), MetricValue::Int(code));
            }
        }

        event
    }

    /// Hands the record to the callback. Fires at most once per request;
    /// a panicking callback is trapped so the underlying request is never
    /// disturbed.
    pub(crate) fn emit(&mut self, callback: &MetricsCallback) {
        if self.emitted {
            return;
        }
        self.emitted = true;
        let event = self.to_event();
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            error!("http metrics callback panicked, record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Request;
    use std::sync::Mutex;

    fn options(uri: &str) -> RequestOptions {
        let request = Request::builder()
            .uri(uri)
            .body(Bytes::new())
            .expect("request should build");
        RequestOptions::from_request(&request).expect("options")
    }

    fn collector() -> (MetricsCallback, Arc<Mutex<Vec<MetricMap>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MetricsCallback = Arc::new(move |event| {
            sink.lock().expect("sink").push(event);
        });
        (callback, seen)
    }

    #[test]
    fn test_event_carries_request_attributes() {
        let record = HttpRequestMetrics::new(options("http://subdomain.example.com/test"));
        let event = record.to_event();
        assert_eq!(
            event.get("url"),
            Some(&MetricValue::Str(
                "http://subdomain.example.com/test".to_string()
            ))
        );
        assert_eq!(
            event.get("domain"),
            Some(&MetricValue::Str("example.com".to_string()))
        );
        assert_eq!(event.get("port"), Some(&MetricValue::Int(80)));
        assert_eq!(event.get("requestBodySize"), Some(&MetricValue::Int(0)));
        assert!(!event.contains_key("responseCode"));
        assert!(!event.contains_key("error"));
    }

    #[test]
    fn test_event_carries_response_attributes() {
        let mut record = HttpRequestMetrics::new(options("http://example.com/"));
        record.response = Some(ResponseInfo {
            status: 200,
            status_text: Some("OK"),
            content_type: Some("application/json".to_string()),
            server_request_id: Some("R".to_string()),
            body_size: 11,
        });
        let event = record.to_event();
        assert_eq!(event.get("responseCode"), Some(&MetricValue::Int(200)));
        assert_eq!(
            event.get("responseStatus"),
            Some(&MetricValue::Str("OK".to_string()))
        );
        assert_eq!(
            event.get("serverRequestId"),
            Some(&MetricValue::Str("R".to_string()))
        );
        assert_eq!(event.get("responseBodySize"), Some(&MetricValue::Int(11)));
    }

    #[test]
    fn test_event_carries_error_attributes() {
        let mut record = HttpRequestMetrics::new(options("http://example.com/"));
        record.record_error(&HttpError::TimedOut);
        let event = record.to_event();
        assert_eq!(event.get("error"), Some(&MetricValue::Bool(true)));
        assert_eq!(
            event.get("errorMessage"),
            Some(&MetricValue::Str("Connection timed out".to_string()))
        );
        assert_eq!(event.get("errorCode"), Some(&MetricValue::Int(110)));
        assert!(event.contains_key("duration"));
    }

    #[test]
    fn test_emit_fires_at_most_once() {
        let (callback, seen) = collector();
        let mut record = HttpRequestMetrics::new(options("http://example.com/"));
        record.emit(&callback);
        record.emit(&callback);
        assert_eq!(seen.lock().expect("seen").len(), 1);
    }

    #[test]
    fn test_emit_traps_callback_panic() {
        let callback: MetricsCallback = Arc::new(|_| panic!("listener bug"));
        let mut record = HttpRequestMetrics::new(options("http://example.com/"));
        record.emit(&callback);
    }

    // Serializes tests that touch the process-global probe state.
    static PROBE_TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_start_first_caller_wins() {
        let _guard = PROBE_TEST_LOCK.lock().expect("probe test lock");
        stop();
        let (first, seen_first) = collector();
        let (second, seen_second) = collector();
        assert!(start(first));
        assert!(!start(second));

        let mut record = HttpRequestMetrics::new(options("http://example.com/"));
        let callback = installed_callback().expect("installed");
        record.emit(&callback);

        assert_eq!(seen_first.lock().expect("seen").len(), 1);
        assert!(seen_second.lock().expect("seen").is_empty());
        stop();
        assert!(!is_installed());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let _guard = PROBE_TEST_LOCK.lock().expect("probe test lock");
        stop();
        stop();
        assert!(!is_installed());
    }
}
