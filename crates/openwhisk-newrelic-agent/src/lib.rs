//! # OpenWhisk New Relic Agent
//!
//! This crate provides a per-activation metrics agent for Apache OpenWhisk
//! actions. Each invocation of an action creates an [`Agent`] that collects
//! metric events and ships them, batched and gzipped, to a New Relic
//! Insights-compatible event ingest endpoint.
//!
//! ## Overview
//!
//! The agent covers three concerns:
//! - **HTTP instrumentation**: every outgoing HTTP/HTTPS request issued
//!   through the instrumented client produces one timing/size event
//! - **Custom metrics**: action code can submit arbitrary events via
//!   [`Agent::send`]
//! - **Timeout coverage**: a `timeout` event is emitted and flushed just
//!   before the platform deadline kills the activation
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - [`agent`]: the per-activation [`Agent`] façade and the
//!   [`instrument`] wrapper that binds the activation scope
//! - [`probe`]: the HTTP client probe producing one metric record per
//!   outgoing request
//! - [`context`]: task-local activation scope routing probe records back
//!   to the originating activation's agent
//! - [`queue`]: the process-wide send queue batching events to the ingest
//!   endpoint
//! - [`metrics`]: the metric value model and the event flattener
//! - [`env`]: activation identity and deadline read from the OpenWhisk
//!   environment
//!
//! ## Usage
//!
//! ```rust,ignore
//! use openwhisk_newrelic_agent::{instrument, Agent, AgentOptions, MetricMap};
//!
//! let main = instrument(|params: serde_json::Value| async move {
//!     let agent = Agent::new(
//!         AgentOptions::new("https://insights-collector.newrelic.com/v1/accounts/123/events", "key"),
//!         None,
//!     );
//!     // ... action logic; outgoing requests via probe::HttpClient are observed ...
//!     agent.send("activation", MetricMap::new());
//!     agent.activation_finished();
//!     params
//! });
//! ```

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

/// Per-activation agent façade and activation instrumentation
pub mod agent;

/// Task-local activation scope binding
pub mod context;

/// Activation identity, deadline, and container probes
pub mod env;

/// Error taxonomy
pub mod error;

/// Tracing setup and log formatting
pub mod logger;

/// Metric value model and event flattener
pub mod metrics;

/// HTTP client probe
pub mod probe;

/// Process-wide send queue
pub mod queue;

pub use agent::{
    instrument, instrument_with, stop_instrument, Agent, AgentOptions, InstrumentOptions,
    Instrumented, TimeoutMetricsCallback,
};
pub use error::{AgentError, HttpError};
pub use metrics::{MetricMap, MetricValue};
pub use probe::client::HttpClient;

/// User agent reported on every ingest POST.
///
/// Doubles as the loop-breaker: the probe never emits a record for an
/// outgoing request whose `User-Agent` header equals this value, so the
/// agent's own uploads are never observed as action traffic.
pub const AGENT_USER_AGENT: &str =
    concat!("openwhisk-newrelic-agent/", env!("CARGO_PKG_VERSION"));

/// Maximum number of events shipped per ingest POST.
///
/// Keeps each gzipped request comfortably below the ingest endpoint's
/// 1 MB per-request ceiling.
pub const MAX_EVENTS_PER_BATCH: usize = 50;
