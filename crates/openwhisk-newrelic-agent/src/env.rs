//! Activation identity and deadline read from the OpenWhisk environment.
//!
//! OpenWhisk exposes activation metadata to the action container through
//! `__OW_*` environment variables. This module reads them once per agent
//! construction; a missing variable yields a missing key, never an error.
//!
//! Two container probe files are also consulted on Linux (memory limit
//! from the cgroup filesystem, OS identity from `os-release`); every file
//! error is swallowed silently.

use std::env;
use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::metrics::{MetricMap, MetricValue};

const CGROUP_V2_MEMORY_MAX_PATH: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_MEMORY_LIMIT_PATH: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const OS_RELEASE_PATHS: [&str; 2] = ["/etc/os-release", "/usr/lib/os-release"];

/// Activation identity and deadline, captured from the environment.
#[derive(Debug, Clone, Default)]
pub struct ActivationEnv {
    /// Last segment of `__OW_ACTION_NAME`.
    pub action_name: Option<String>,
    /// Third-from-last segment of `__OW_ACTION_NAME`, when present.
    pub package: Option<String>,
    pub namespace: Option<String>,
    pub activation_id: Option<String>,
    pub transaction_id: Option<String>,
    pub region: Option<String>,
    pub cloud: Option<String>,
    /// `HOSTNAME` of the invoker host.
    pub activation_host: Option<String>,
    /// `MESOS_CONTAINER_NAME` of the action container.
    pub activation_container_name: Option<String>,
    /// Absolute activation deadline, milliseconds since the Unix epoch.
    pub deadline_ms: Option<u64>,
}

impl ActivationEnv {
    /// Reads the activation environment.
    #[must_use]
    pub fn from_env() -> Self {
        let (action_name, package) = env::var("__OW_ACTION_NAME")
            .ok()
            .map(|raw| parse_action_name(&raw))
            .unwrap_or((None, None));

        ActivationEnv {
            action_name,
            package,
            namespace: env::var("__OW_NAMESPACE").ok(),
            activation_id: env::var("__OW_ACTIVATION_ID").ok(),
            transaction_id: env::var("__OW_TRANSACTION_ID").ok(),
            region: env::var("__OW_REGION").ok(),
            cloud: env::var("__OW_CLOUD").ok(),
            activation_host: env::var("HOSTNAME").ok(),
            activation_container_name: env::var("MESOS_CONTAINER_NAME").ok(),
            deadline_ms: env::var("__OW_DEADLINE")
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok()),
        }
    }

    /// Time left until the platform kills the activation.
    ///
    /// Returns `None` when no deadline was provided; saturates at zero
    /// once the deadline has passed.
    #[must_use]
    pub fn time_until_timeout(&self) -> Option<Duration> {
        let deadline_ms = self.deadline_ms?;
        let now_ms = epoch_millis();
        Some(Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
    }

    /// Identity keys merged into every event produced by an agent.
    #[must_use]
    pub fn identity_metrics(&self) -> MetricMap {
        let mut metrics = MetricMap::new();
        insert_opt(&mut metrics, "actionName", self.action_name.as_ref());
        insert_opt(&mut metrics, "package", self.package.as_ref());
        insert_opt(&mut metrics, "namespace", self.namespace.as_ref());
        insert_opt(&mut metrics, "activationId", self.activation_id.as_ref());
        insert_opt(&mut metrics, "transactionId", self.transaction_id.as_ref());
        insert_opt(&mut metrics, "region", self.region.as_ref());
        insert_opt(&mut metrics, "cloud", self.cloud.as_ref());
        insert_opt(&mut metrics, "activationHost", self.activation_host.as_ref());
        insert_opt(
            &mut metrics,
            "activationContainerName",
            self.activation_container_name.as_ref(),
        );
        metrics
    }
}

/// Current wall clock as milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Truthiness for the `DISABLE_*` flag variables.
///
/// Any non-empty value other than `false` / `0` (case-insensitive) counts
/// as set.
#[must_use]
pub(crate) fn flag_enabled(var: &str) -> bool {
    match env::var(var) {
        Ok(value) => {
            let value = value.trim().to_lowercase();
            !value.is_empty() && value != "false" && value != "0"
        }
        Err(_) => false,
    }
}

/// Numeric environment override, ignored when absent or unparseable.
pub(crate) fn env_u64(var: &str) -> Option<u64> {
    env::var(var).ok().and_then(|raw| raw.trim().parse().ok())
}

/// Splits `__OW_ACTION_NAME` into action name and package.
///
/// The variable has the form `/namespace/package/action` (the package
/// segment is absent for unpackaged actions). The action name is the last
/// segment, the package the third-from-last; an empty package segment is
/// treated as absent.
fn parse_action_name(raw: &str) -> (Option<String>, Option<String>) {
    let parts: Vec<&str> = raw.split('/').collect();
    let action = parts
        .last()
        .filter(|segment| !segment.is_empty())
        .map(|segment| (*segment).to_string());
    let package = (parts.len() >= 3)
        .then(|| parts[parts.len() - 3])
        .filter(|segment| !segment.is_empty())
        .map(str::to_string);
    (action, package)
}

/// Container-level metrics from the container probe files.
///
/// Adds `containerMemorySize`, `containerOS`, and `containerOSVersion`
/// when the backing files are readable; absent otherwise.
#[must_use]
pub(crate) fn container_metrics() -> MetricMap {
    let mut metrics = MetricMap::new();
    if let Some(limit) = container_memory_size() {
        metrics.insert("containerMemorySize".to_string(), MetricValue::Int(limit));
    }
    if let Some((os, version)) = container_os() {
        metrics.insert("containerOS".to_string(), MetricValue::Str(os));
        if let Some(version) = version {
            metrics.insert("containerOSVersion".to_string(), MetricValue::Str(version));
        }
    }
    metrics
}

/// Container memory limit in bytes.
///
/// Probes the cgroup v2 unified path first and falls back to the v1
/// controller path. A v2 value of `max` means no limit and yields `None`.
fn container_memory_size() -> Option<i64> {
    read_memory_limit(CGROUP_V2_MEMORY_MAX_PATH)
        .or_else(|| read_memory_limit(CGROUP_V1_MEMORY_LIMIT_PATH))
}

fn read_memory_limit(path: &str) -> Option<i64> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<i64>().ok())
}

/// Container OS name and version from `os-release`.
fn container_os() -> Option<(String, Option<String>)> {
    OS_RELEASE_PATHS
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .and_then(|contents| parse_os_release(&contents))
}

/// Extracts `NAME` and `VERSION_ID` from an `os-release` file body.
fn parse_os_release(contents: &str) -> Option<(String, Option<String>)> {
    let mut name = None;
    let mut version = None;
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').to_string();
            match key.trim() {
                "NAME" => name = Some(value),
                "VERSION_ID" => version = Some(value),
                _ => {}
            }
        }
    }
    name.map(|name| (name, version))
}

fn insert_opt(metrics: &mut MetricMap, key: &str, value: Option<&String>) {
    if let Some(value) = value {
        metrics.insert(key.to_string(), MetricValue::Str(value.clone()));
    }
}
