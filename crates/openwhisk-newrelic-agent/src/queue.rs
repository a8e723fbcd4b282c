//! Process-wide send queue.
//!
//! A single actor task owns the event queue for the whole process: agents
//! enqueue through a cloneable handle, and the service drains the queue,
//! on a periodic tick or on demand, into gzipped JSON batches POSTed to
//! the ingest endpoint.
//!
//! # Actor pattern
//!
//! ```text
//!    Agents (many)                 QueueService (one task)
//!        │ Send / SendImmediate        │
//!        └────────── mpsc ────────────>│ owns VecDeque, flushes
//!                                      v
//!                              ingest endpoint (gzipped POST)
//! ```
//!
//! Commands and tick flushes interleave through one loop, so queue
//! mutations are serialized without locks and events within a POST keep
//! their enqueue order.
//!
//! # Delivery semantics
//!
//! Best-effort, at-most-once. A non-success response or transport error
//! is logged and the batch is discarded; there are no retries and no
//! local persistence. `stop` drops whatever is still queued.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::AgentError;
use crate::metrics::flatten::{flatten, FlatMap};
use crate::metrics::MetricMap;
use crate::{AGENT_USER_AGENT, MAX_EVENTS_PER_BATCH};

/// Default flush interval in production.
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 10_000;

static QUEUE: OnceLock<Mutex<Option<QueueHandle>>> = OnceLock::new();

fn queue_cell() -> &'static Mutex<Option<QueueHandle>> {
    QUEUE.get_or_init(|| Mutex::new(None))
}

/// Commands sent from handles to the queue service.
#[derive(Debug)]
enum QueueCommand {
    /// Append one event; shipped on the next flush.
    Send(MetricMap),
    /// Append one event and flush before responding.
    SendImmediate(MetricMap, oneshot::Sender<Result<(), AgentError>>),
    /// Stop the service, dropping anything still queued.
    Stop(oneshot::Sender<()>),
}

/// Cloneable sender side of the queue.
#[derive(Clone, Debug)]
pub(crate) struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl QueueHandle {
    /// Non-blocking append.
    pub(crate) fn send(&self, event: MetricMap) -> Result<(), AgentError> {
        self.tx
            .send(QueueCommand::Send(event))
            .map_err(|_| AgentError::QueueUnavailable)
    }

    /// Append and flush, awaiting upload completion.
    pub(crate) async fn send_immediate(&self, event: MetricMap) -> Result<(), AgentError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::SendImmediate(event, response_tx))
            .map_err(|_| AgentError::QueueUnavailable)?;
        response_rx.await.map_err(|_| AgentError::QueueUnavailable)?
    }
}

/// Starts the process-wide queue if it is not already running.
///
/// The first caller fixes the endpoint, API key, and flush interval;
/// later callers get the existing handle back regardless of what they
/// pass.
pub(crate) fn start(url: &str, api_key: &str, interval: Duration) -> QueueHandle {
    let mut slot = match queue_cell().lock() {
        Ok(slot) => slot,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(handle) = slot.as_ref() {
        return handle.clone();
    }

    let (service, handle) = QueueService::new(url.to_string(), api_key.to_string(), interval);
    tokio::spawn(service.run());
    *slot = Some(handle.clone());
    debug!("send queue started, interval {} ms", interval.as_millis());
    handle
}

/// Stops the queue and clears the process-wide handle.
///
/// Queued events are dropped, not shipped. Production activations never
/// call this; it exists so test harnesses can tear the singleton down
/// between cases.
pub async fn stop() {
    let handle = {
        let mut slot = match queue_cell().lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    };
    if let Some(handle) = handle {
        let (response_tx, response_rx) = oneshot::channel();
        if handle.tx.send(QueueCommand::Stop(response_tx)).is_ok() {
            let _ = response_rx.await;
        }
    }
}

/// The actor task owning the queue.
struct QueueService {
    url: String,
    api_key: String,
    interval: Duration,
    client: reqwest::Client,
    queue: VecDeque<MetricMap>,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
}

impl QueueService {
    fn new(url: String, api_key: String, interval: Duration) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|error| {
                error!("failed to build ingest client, using defaults: {error}");
                reqwest::Client::new()
            });
        let service = QueueService {
            url,
            api_key,
            interval,
            client,
            queue: VecDeque::new(),
            rx,
        };
        (service, QueueHandle { tx })
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; swallow it so the
        // queue gets a full interval to accumulate.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.flush().await;
                }
                command = self.rx.recv() => match command {
                    Some(QueueCommand::Send(event)) => {
                        self.queue.push_back(event);
                    }
                    Some(QueueCommand::SendImmediate(event, response_tx)) => {
                        self.queue.push_back(event);
                        let result = self.flush_strict().await;
                        if response_tx.send(result).is_err() {
                            debug!("immediate send caller went away before upload finished");
                        }
                    }
                    Some(QueueCommand::Stop(response_tx)) => {
                        if !self.queue.is_empty() {
                            warn!("send queue stopping, dropping {} unsent events", self.queue.len());
                        }
                        self.queue.clear();
                        let _ = response_tx.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("send queue service stopped");
    }

    /// Drains the queue in batches. Never fails; every problem is logged
    /// and the offending batch or event is dropped.
    async fn flush(&mut self) {
        if let Err(error) = self.flush_strict().await {
            error!("failed to flush metrics batch: {error}");
        }
    }

    /// Like [`flush`](Self::flush) but reports the first failure, for the
    /// immediate path. Later batches still get their chance.
    async fn flush_strict(&mut self) -> Result<(), AgentError> {
        let mut first_failure = None;
        while !self.queue.is_empty() {
            let take = self.queue.len().min(MAX_EVENTS_PER_BATCH);
            let batch: Vec<MetricMap> = self.queue.drain(..take).collect();
            if let Err(error) = self.post_batch(&batch).await {
                if first_failure.is_none() {
                    first_failure = Some(error);
                }
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Flattens, serializes, gzips, and POSTs one batch.
    async fn post_batch(&self, batch: &[MetricMap]) -> Result<(), AgentError> {
        let mut flattened: Vec<FlatMap> = Vec::with_capacity(batch.len());
        let mut first_failure = None;
        for event in batch {
            match flatten(event) {
                Ok(flat) => flattened.push(flat),
                Err(error) => {
                    error!("dropping unflattenable event: {error}");
                    if first_failure.is_none() {
                        first_failure = Some(AgentError::from(error));
                    }
                }
            }
        }
        if flattened.is_empty() {
            return match first_failure {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }

        let body = serde_json::to_vec(&flattened)?;
        let compressed = gzip(&body)?;
        debug!(
            "posting {} events ({} bytes gzipped)",
            flattened.len(),
            compressed.len()
        );

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .header("X-Insert-Key", &self.api_key)
            .header("User-Agent", AGENT_USER_AGENT)
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            debug!("metrics ingest accepted batch: {text}");
        } else {
            error!(
                "metrics ingest rejected batch ({} events): status {status}, {text}",
                flattened.len()
            );
            return Err(AgentError::IngestStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, AgentError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use std::io::Read;

    fn event(event_type: &str) -> MetricMap {
        let mut map = MetricMap::new();
        map.insert(
            "eventType".to_string(),
            MetricValue::Str(event_type.to_string()),
        );
        map
    }

    #[test]
    fn test_gzip_round_trips() {
        let compressed = gzip(b"[{\"eventType\":\"custom\"}]").expect("gzip");
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decompressed = String::new();
        decoder
            .read_to_string(&mut decompressed)
            .expect("gunzip");
        assert_eq!(decompressed, "[{\"eventType\":\"custom\"}]");
    }

    #[tokio::test]
    async fn test_handle_send_enqueues() {
        let (service, handle) =
            QueueService::new("http://127.0.0.1:1/events".to_string(), "k".to_string(), Duration::from_secs(3600));
        tokio::spawn(service.run());

        assert!(handle.send(event("custom")).is_ok());
    }

    #[tokio::test]
    async fn test_send_immediate_surfaces_transport_failure() {
        // Nothing listens on port 1, so the immediate flush must fail.
        let (service, handle) = QueueService::new(
            "http://127.0.0.1:1/events".to_string(),
            "k".to_string(),
            Duration::from_secs(3600),
        );
        tokio::spawn(service.run());

        let result = handle.send_immediate(event("custom")).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }

    #[tokio::test]
    async fn test_send_immediate_surfaces_flatten_failure() {
        let (service, handle) = QueueService::new(
            "http://127.0.0.1:1/events".to_string(),
            "k".to_string(),
            Duration::from_secs(3600),
        );
        tokio::spawn(service.run());

        let mut bad = event("custom");
        bad.insert("cb".to_string(), MetricValue::Opaque("function"));
        let result = handle.send_immediate(bad).await;
        assert!(matches!(result, Err(AgentError::Flatten(_))));
    }

    #[tokio::test]
    async fn test_stopped_service_rejects_sends() {
        let (service, handle) = QueueService::new(
            "http://127.0.0.1:1/events".to_string(),
            "k".to_string(),
            Duration::from_secs(3600),
        );
        let task = tokio::spawn(service.run());

        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(QueueCommand::Stop(tx))
            .expect("stop should send");
        rx.await.expect("stop should be acknowledged");
        let _ = task.await;

        assert!(matches!(
            handle.send(event("custom")),
            Err(AgentError::QueueUnavailable)
        ));
    }
}
