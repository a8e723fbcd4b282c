//! Per-activation agent façade.
//!
//! Action code constructs one [`Agent`] per activation, inside the scope
//! opened by [`instrument`]. The agent merges activation identity into
//! every event, feeds the process-wide send queue, and guarantees a
//! `timeout` event ships just before the platform deadline kills the
//! activation.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::context;
use crate::env::{self, epoch_millis, flag_enabled, ActivationEnv};
use crate::error::AgentError;
use crate::metrics::{MetricMap, MetricValue};
use crate::probe;
use crate::queue::{self, DEFAULT_SEND_INTERVAL_MS};

/// Safety margin before the platform deadline: the timeout event is sent
/// this long before the activation would be killed, leaving the flush
/// time to complete.
pub const TIMEOUT_EVENT_BUFFER_MS: u64 = 5_000;

/// Computes the metrics bag for the deadline timeout event.
///
/// A returned `eventType` overrides the default `"timeout"`.
pub type TimeoutMetricsCallback = Arc<dyn Fn() -> MetricMap + Send + Sync>;

/// Construction options for an [`Agent`].
#[derive(Clone, Default)]
pub struct AgentOptions {
    url: String,
    api_key: String,
    send_interval_ms: Option<u64>,
    disable_action_timeout: bool,
    action_timeout_metrics_cb: Option<TimeoutMetricsCallback>,
}

impl AgentOptions {
    /// Options with the ingest endpoint URL and API key. Both must be
    /// non-blank or the agent comes up disabled.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        AgentOptions {
            url: url.into(),
            api_key: api_key.into(),
            ..AgentOptions::default()
        }
    }

    /// Overrides the queue flush interval. Only the first agent in the
    /// process gets to pick; the running queue keeps its interval.
    #[must_use]
    pub fn send_interval_ms(mut self, interval_ms: u64) -> Self {
        self.send_interval_ms = Some(interval_ms);
        self
    }

    /// Disables the pre-deadline timeout event for this agent.
    #[must_use]
    pub fn disable_action_timeout(mut self, disable: bool) -> Self {
        self.disable_action_timeout = disable;
        self
    }

    /// Custom metrics for the timeout event, computed when the deadline
    /// timer fires.
    #[must_use]
    pub fn action_timeout_metrics_cb(
        mut self,
        callback: impl Fn() -> MetricMap + Send + Sync + 'static,
    ) -> Self {
        self.action_timeout_metrics_cb = Some(Arc::new(callback));
        self
    }
}

struct AgentInner {
    default_metrics: Mutex<MetricMap>,
    queue: Option<queue::QueueHandle>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

/// Per-activation metrics agent. Cloning yields another handle to the
/// same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Creates the agent for the current activation.
    ///
    /// Environment-derived identity is merged under `default_metrics`
    /// (caller keys win) and rides along on every event. A blank URL or
    /// API key logs once and yields a disabled agent whose `send` calls
    /// are no-ops. When an activation scope is open the agent registers
    /// itself so probe records find their way back here.
    #[must_use]
    pub fn new(options: AgentOptions, default_metrics: Option<MetricMap>) -> Self {
        let activation_env = ActivationEnv::from_env();
        let mut defaults = activation_env.identity_metrics();
        defaults.extend(env::container_metrics());
        if let Some(user_defaults) = default_metrics {
            defaults.extend(user_defaults);
        }

        let disabled =
            options.url.trim().is_empty() || options.api_key.trim().is_empty();
        let queue = if disabled {
            error!("agent disabled: ingest url and api key must be non-blank strings");
            None
        } else {
            let interval_ms = options
                .send_interval_ms
                .or_else(|| env::env_u64("NEW_RELIC_SEND_INTERVAL_MS"))
                .unwrap_or(DEFAULT_SEND_INTERVAL_MS);
            Some(queue::start(
                &options.url,
                &options.api_key,
                Duration::from_millis(interval_ms),
            ))
        };

        let agent = Agent {
            inner: Arc::new(AgentInner {
                default_metrics: Mutex::new(defaults),
                queue,
                timeout_task: Mutex::new(None),
            }),
        };

        context::register_agent(&agent);

        if !disabled
            && !options.disable_action_timeout
            && !flag_enabled("DISABLE_ACTION_TIMEOUT_METRIC")
        {
            agent.arm_deadline_timer(&activation_env, options.action_timeout_metrics_cb);
        }

        agent
    }

    /// Enqueues one event.
    ///
    /// The event is the caller's map merged over `{eventType, timestamp}`
    /// and the agent's default metrics; caller keys win. Disabled agents
    /// drop the event silently.
    pub fn send(&self, event_type: &str, event: MetricMap) {
        let Some(queue) = &self.inner.queue else {
            debug!("agent disabled, dropping {event_type} event");
            return;
        };
        if let Err(send_error) = queue.send(self.merge(event_type, event)) {
            error!("failed to enqueue {event_type} event: {send_error}");
        }
    }

    /// Enqueues one event and flushes the queue before returning.
    ///
    /// Transport and schema failures surface to the caller; everything is
    /// already logged by the queue, so ignoring the result never hides a
    /// failure.
    pub async fn send_immediate(
        &self,
        event_type: &str,
        event: MetricMap,
    ) -> Result<(), AgentError> {
        let Some(queue) = &self.inner.queue else {
            debug!("agent disabled, dropping {event_type} event");
            return Ok(());
        };
        queue.send_immediate(self.merge(event_type, event)).await
    }

    /// Merges additional default metrics; later keys win.
    pub fn add(&self, partial: MetricMap) {
        let mut defaults = match self.inner.default_metrics.lock() {
            Ok(defaults) => defaults,
            Err(poisoned) => poisoned.into_inner(),
        };
        defaults.extend(partial);
    }

    /// Snapshot of the current default metrics.
    #[must_use]
    pub fn get(&self) -> MetricMap {
        match self.inner.default_metrics.lock() {
            Ok(defaults) => defaults.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cancels the pending timeout event. Idempotent; call it when the
    /// activation completes normally.
    pub fn activation_finished(&self) {
        let task = {
            let mut slot = match self.inner.timeout_task.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
            debug!("deadline timer cancelled");
        }
    }

    fn merge(&self, event_type: &str, event: MetricMap) -> MetricMap {
        let mut merged = MetricMap::new();
        merged.insert(
            "eventType".to_string(),
            MetricValue::Str(event_type.to_string()),
        );
        merged.insert(
            "timestamp".to_string(),
            MetricValue::Int(i64::try_from(epoch_millis()).unwrap_or(i64::MAX)),
        );
        merged.extend(self.get());
        merged.extend(event);
        merged
    }

    /// Schedules the timeout event ahead of the platform deadline.
    fn arm_deadline_timer(
        &self,
        activation_env: &ActivationEnv,
        callback: Option<TimeoutMetricsCallback>,
    ) {
        let Some(remaining) = activation_env.time_until_timeout() else {
            debug!("no activation deadline in environment, timeout event disarmed");
            return;
        };
        let fire_in = remaining.saturating_sub(Duration::from_millis(TIMEOUT_EVENT_BUFFER_MS));
        let remaining_ms = i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX);

        let agent = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(fire_in).await;
            let (event_type, bag) = timeout_event(remaining_ms, callback.as_ref());
            if let Err(send_error) = agent.send_immediate(&event_type, bag).await {
                error!("failed to send timeout event: {send_error}");
            }
        });

        let mut slot = match self.inner.timeout_task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(task);
    }
}

/// Builds the timeout event: the callback's bag when one is configured
/// (its `eventType` key, if a string, names the event), else
/// `{duration}` under the default `timeout` type.
fn timeout_event(
    remaining_ms: i64,
    callback: Option<&TimeoutMetricsCallback>,
) -> (String, MetricMap) {
    let mut bag = match callback {
        Some(callback) => callback(),
        None => {
            let mut bag = MetricMap::new();
            bag.insert("duration".to_string(), MetricValue::Int(remaining_ms));
            bag
        }
    };
    let event_type = match bag.remove("eventType") {
        Some(MetricValue::Str(event_type)) => event_type,
        Some(_) | None => "timeout".to_string(),
    };
    (event_type, bag)
}

/// Options for [`instrument_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentOptions {
    disable_http_instrumentation: bool,
}

impl InstrumentOptions {
    #[must_use]
    pub fn new() -> Self {
        InstrumentOptions::default()
    }

    /// Skips installing the HTTP probe.
    #[must_use]
    pub fn disable_http_instrumentation(mut self, disable: bool) -> Self {
        self.disable_http_instrumentation = disable;
        self
    }
}

/// An action main wrapped with activation scoping.
pub struct Instrumented<F> {
    main: F,
}

impl<F> Instrumented<F> {
    /// Runs the wrapped main inside a fresh activation scope.
    pub async fn invoke<P, Fut>(&self, params: P) -> Fut::Output
    where
        F: Fn(P) -> Fut,
        Fut: Future,
    {
        context::open((self.main)(params)).await
    }
}

/// Installs the HTTP probe (first call wins) and wraps an action main so
/// each invocation runs in its own activation scope.
///
/// Probe installation is skipped when
/// `OPENWHISK_NEWRELIC_DISABLE_ALL_INSTRUMENTATION` or
/// `OPENWHISK_NEWRELIC_DISABLE_HTTP_INSTRUMENTATION` is set.
pub fn instrument<F>(main: F) -> Instrumented<F> {
    instrument_with(main, InstrumentOptions::default())
}

/// [`instrument`] with explicit options.
pub fn instrument_with<F>(main: F, options: InstrumentOptions) -> Instrumented<F> {
    let disabled = options.disable_http_instrumentation
        || flag_enabled("OPENWHISK_NEWRELIC_DISABLE_ALL_INSTRUMENTATION")
        || flag_enabled("OPENWHISK_NEWRELIC_DISABLE_HTTP_INSTRUMENTATION");
    if !disabled {
        probe::start(Arc::new(route_http_record));
    }
    Instrumented { main }
}

/// Uninstalls the HTTP probe. Idempotent; in-flight requests still emit.
pub fn stop_instrument() {
    probe::stop();
}

/// Probe callback: resolves the issuing activation's agent through the
/// scope and forwards the record as an `http` event.
fn route_http_record(record: MetricMap) {
    match context::current_agent() {
        Some(agent) => agent.send("http", record),
        None => {
            error!("no agent registered for this activation, dropping http metric record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_agent() -> Agent {
        Agent::new(AgentOptions::new("", ""), None)
    }

    #[tokio::test]
    async fn test_blank_options_disable_the_agent() {
        let agent = disabled_agent();
        // Disabled sends are silent no-ops.
        agent.send("custom", MetricMap::new());
        assert!(agent
            .send_immediate("custom", MetricMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_add_and_get_round_trip() {
        let agent = disabled_agent();
        let mut partial = MetricMap::new();
        partial.insert("team".to_string(), MetricValue::Str("runtime".to_string()));
        agent.add(partial);
        assert_eq!(
            agent.get().get("team"),
            Some(&MetricValue::Str("runtime".to_string()))
        );
    }

    #[tokio::test]
    async fn test_add_overrides_existing_defaults() {
        let agent = disabled_agent();
        let mut first = MetricMap::new();
        first.insert("k".to_string(), MetricValue::Int(1));
        agent.add(first);
        let mut second = MetricMap::new();
        second.insert("k".to_string(), MetricValue::Int(2));
        agent.add(second);
        assert_eq!(agent.get().get("k"), Some(&MetricValue::Int(2)));
    }

    #[tokio::test]
    async fn test_merge_caller_keys_win() {
        let agent = disabled_agent();
        let mut defaults = MetricMap::new();
        defaults.insert("shared".to_string(), MetricValue::Str("default".to_string()));
        agent.add(defaults);

        let mut event = MetricMap::new();
        event.insert("shared".to_string(), MetricValue::Str("caller".to_string()));
        let merged = agent.merge("custom", event);

        assert_eq!(
            merged.get("shared"),
            Some(&MetricValue::Str("caller".to_string()))
        );
        assert_eq!(
            merged.get("eventType"),
            Some(&MetricValue::Str("custom".to_string()))
        );
        assert!(matches!(merged.get("timestamp"), Some(MetricValue::Int(_))));
    }

    #[tokio::test]
    async fn test_activation_finished_is_idempotent() {
        let agent = disabled_agent();
        agent.activation_finished();
        agent.activation_finished();
    }

    #[test]
    fn test_timeout_event_default_shape() {
        let (event_type, bag) = timeout_event(90_000, None);
        assert_eq!(event_type, "timeout");
        assert_eq!(bag.get("duration"), Some(&MetricValue::Int(90_000)));
    }

    #[test]
    fn test_timeout_event_callback_overrides_type() {
        let callback: TimeoutMetricsCallback = Arc::new(|| {
            let mut bag = MetricMap::new();
            bag.insert(
                "eventType".to_string(),
                MetricValue::Str("custom".to_string()),
            );
            bag.insert("test".to_string(), MetricValue::Str("add_value".to_string()));
            bag
        });
        let (event_type, bag) = timeout_event(1_000, Some(&callback));
        assert_eq!(event_type, "custom");
        assert_eq!(
            bag.get("test"),
            Some(&MetricValue::Str("add_value".to_string()))
        );
        assert!(!bag.contains_key("eventType"));
    }

    #[test]
    fn test_timeout_event_non_string_type_falls_back() {
        let callback: TimeoutMetricsCallback = Arc::new(|| {
            let mut bag = MetricMap::new();
            bag.insert("eventType".to_string(), MetricValue::Int(5));
            bag
        });
        let (event_type, _bag) = timeout_event(1_000, Some(&callback));
        assert_eq!(event_type, "timeout");
    }

    #[test]
    fn test_options_builder() {
        let options = AgentOptions::new("http://u", "k")
            .send_interval_ms(25)
            .disable_action_timeout(true);
        assert_eq!(options.send_interval_ms, Some(25));
        assert!(options.disable_action_timeout);
    }
}
