//! Environment configuration for the control plane.
//!
//! Durations are given as human-readable strings ("10s", "1m", "120h").
//! A value that fails to parse falls back to its default with a logged
//! error, matching the tolerant behavior operators rely on during upgrades;
//! only a missing variable is silent.

use std::time::Duration;

/// Environment-derived service configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Period of the sequence dispatcher (`SEQUENCE_DISPATCH_INTERVAL_SEC`).
    pub sequence_dispatch_interval: Duration,
    /// Period of the event dispatcher (`EVENT_DISPATCH_INTERVAL_SEC`).
    pub event_dispatch_interval: Duration,
    /// Period of the sequence watcher (`SEQUENCE_WATCHER_INTERVAL`).
    pub sequence_watcher_interval: Duration,
    /// How long a task `.triggered` may stay unanswered
    /// (`TASK_STARTED_WAIT_DURATION`).
    pub task_started_wait_duration: Duration,
    /// Retention of log entries (`LOG_TTL`); applied by database-backed
    /// stores as a TTL index.
    pub log_ttl: Duration,
    /// Retention of executor registrations (`UNIFORM_INTEGRATION_TTL`).
    pub uniform_integration_ttl: Duration,
    /// Single-replica mode without election (`DISABLE_LEADER_ELECTION`).
    pub disable_leader_election: bool,
    /// How long the pre-stop endpoint holds before answering
    /// (`PRE_STOP_HOOK_TIME`, seconds).
    pub pre_stop_hook_time: Duration,
    /// Log filter directive (`LOG_LEVEL`).
    pub log_level: String,
    /// Bus endpoint (`NATS_URL`).
    pub nats_url: String,
    /// Configuration store endpoint (`CONFIGURATION_SERVICE`).
    pub configuration_service: String,
}

const DEFAULT_SEQUENCE_DISPATCH_INTERVAL: &str = "10s";
const DEFAULT_EVENT_DISPATCH_INTERVAL: &str = "10s";
const DEFAULT_SEQUENCE_WATCHER_INTERVAL: &str = "1m";
const DEFAULT_TASK_STARTED_WAIT_DURATION: &str = "10m";
const DEFAULT_LOG_TTL: &str = "120h";
const DEFAULT_UNIFORM_TTL: &str = "1m";
const DEFAULT_PRE_STOP_HOOK_TIME_SECS: u64 = 5;

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            sequence_dispatch_interval: parse_duration(DEFAULT_SEQUENCE_DISPATCH_INTERVAL),
            event_dispatch_interval: parse_duration(DEFAULT_EVENT_DISPATCH_INTERVAL),
            sequence_watcher_interval: parse_duration(DEFAULT_SEQUENCE_WATCHER_INTERVAL),
            task_started_wait_duration: parse_duration(DEFAULT_TASK_STARTED_WAIT_DURATION),
            log_ttl: parse_duration(DEFAULT_LOG_TTL),
            uniform_integration_ttl: parse_duration(DEFAULT_UNIFORM_TTL),
            disable_leader_election: false,
            pre_stop_hook_time: Duration::from_secs(DEFAULT_PRE_STOP_HOOK_TIME_SECS),
            log_level: "info".to_string(),
            nats_url: "nats://keptn-nats:4222".to_string(),
            configuration_service: "http://configuration-service:8080".to_string(),
        }
    }
}

impl EnvConfig {
    /// Reads the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sequence_dispatch_interval: duration_from_env(
                "SEQUENCE_DISPATCH_INTERVAL_SEC",
                DEFAULT_SEQUENCE_DISPATCH_INTERVAL,
            ),
            event_dispatch_interval: duration_from_env(
                "EVENT_DISPATCH_INTERVAL_SEC",
                DEFAULT_EVENT_DISPATCH_INTERVAL,
            ),
            sequence_watcher_interval: duration_from_env(
                "SEQUENCE_WATCHER_INTERVAL",
                DEFAULT_SEQUENCE_WATCHER_INTERVAL,
            ),
            task_started_wait_duration: duration_from_env(
                "TASK_STARTED_WAIT_DURATION",
                DEFAULT_TASK_STARTED_WAIT_DURATION,
            ),
            log_ttl: duration_from_env("LOG_TTL", DEFAULT_LOG_TTL),
            uniform_integration_ttl: duration_from_env(
                "UNIFORM_INTEGRATION_TTL",
                DEFAULT_UNIFORM_TTL,
            ),
            disable_leader_election: bool_from_env("DISABLE_LEADER_ELECTION"),
            pre_stop_hook_time: Duration::from_secs(
                u64_from_env("PRE_STOP_HOOK_TIME", DEFAULT_PRE_STOP_HOOK_TIME_SECS),
            ),
            log_level: string_from_env("LOG_LEVEL", &defaults.log_level),
            nats_url: string_from_env("NATS_URL", &defaults.nats_url),
            configuration_service: string_from_env(
                "CONFIGURATION_SERVICE",
                &defaults.configuration_service,
            ),
        }
    }
}

fn parse_duration(value: &str) -> Duration {
    humantime::parse_duration(value).unwrap_or_default()
}

fn duration_from_env(name: &str, default: &str) -> Duration {
    match std::env::var(name) {
        Ok(value) => match humantime::parse_duration(&value) {
            Ok(duration) => duration,
            Err(error) => {
                tracing::error!(%error, %name, %value, "unparseable duration, using default {default}");
                parse_duration(default)
            }
        },
        Err(_) => parse_duration(default),
    }
}

fn bool_from_env(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn u64_from_env(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::error!(%error, %name, %value, "unparseable integer, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn string_from_env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}
