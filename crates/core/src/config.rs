use std::collections::HashMap;

use serde::Deserialize;

use crate::types::Outcome;

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_dispatches")]
    pub max_concurrent_dispatches: usize,
    /// A dispatch lease older than this is considered abandoned.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Attempts per step, including the first, before the enrollment fails.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_concurrent_dispatches() -> usize { 32 }
fn default_lease_timeout_secs() -> u64 { 300 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_backoff_base_secs() -> u64 { 60 }
fn default_retry_backoff_max_secs() -> u64 { 3600 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_dispatches: default_max_concurrent_dispatches(),
            lease_timeout_secs: default_lease_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Exponential backoff for the given (1-based) failed attempt, capped at
    /// `retry_backoff_max_secs`.
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(20);
        self.retry_backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.retry_backoff_max_secs)
    }
}

// ─── Dispatch Config ────────────────────────────────────────────────────────

/// What to do when a template references a variable with no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingVariablePolicy {
    /// Record a failed event for the step and continue the sequence.
    Skip,
    /// Record a failed event and fail the enrollment.
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    #[serde(default = "default_missing_variable_policy")]
    pub missing_variable_policy: MissingVariablePolicy,
    /// Fallback values keyed by variable name (e.g. `recent_news`).
    #[serde(default)]
    pub variable_defaults: HashMap<String, String>,
    /// Outcomes that end an enrollment whenever they are reported.
    #[serde(default = "default_exit_outcomes")]
    pub exit_outcomes: Vec<Outcome>,
    /// How long provider message ids stay resolvable for status callbacks.
    #[serde(default = "default_correlation_retention_hours")]
    pub correlation_retention_hours: u64,
}

fn default_sender_name() -> String { "The Outreach Team".to_string() }
fn default_missing_variable_policy() -> MissingVariablePolicy { MissingVariablePolicy::Skip }
fn default_exit_outcomes() -> Vec<Outcome> { vec![Outcome::Unsubscribed] }
fn default_correlation_retention_hours() -> u64 { 720 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sender_name: default_sender_name(),
            missing_variable_policy: default_missing_variable_policy(),
            variable_defaults: HashMap::new(),
            exit_outcomes: default_exit_outcomes(),
            correlation_retention_hours: default_correlation_retention_hours(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("dispatch.exit_outcomes"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.scheduler.lease_timeout_secs, 300);
        assert_eq!(
            config.dispatch.missing_variable_policy,
            MissingVariablePolicy::Skip
        );
        assert_eq!(config.dispatch.exit_outcomes, vec![Outcome::Unsubscribed]);
        assert_eq!(config.dispatch.correlation_retention_hours, 720);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SchedulerConfig {
            retry_backoff_base_secs: 60,
            retry_backoff_max_secs: 300,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.backoff_secs(1), 60);
        assert_eq!(config.backoff_secs(2), 120);
        assert_eq!(config.backoff_secs(3), 240);
        assert_eq!(config.backoff_secs(4), 300);
        assert_eq!(config.backoff_secs(40), 300);
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "node_id": "node-07",
            "dispatch": { "missing_variable_policy": "block" }
        }))
        .unwrap();
        assert_eq!(config.node_id, "node-07");
        assert_eq!(
            config.dispatch.missing_variable_policy,
            MissingVariablePolicy::Block
        );
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
        assert_eq!(config.api.http_port, 8080);
    }
}
