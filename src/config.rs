//! Configuration types.
//!
//! Everything has a default; `GatewayConfig::from_env` overrides from
//! `INTAKE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

/// Default confidence below which an AI decision is cross-checked against the
/// rules engine.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Classification & routing engine configuration.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// AI confidence below which the rule-based cross-check runs.
    pub confidence_threshold: f32,
    /// Bound on a single inference call.
    pub inference_timeout: Duration,
    /// Wall-clock budget for the whole `route` call.
    pub routing_budget: Duration,
    /// Allow one inline retry of an unavailable inference call.
    pub retry_unavailable: bool,
    /// Max output tokens requested from the model.
    pub max_output_tokens: u32,
    /// Body characters included in the classification prompt.
    pub body_excerpt_chars: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            inference_timeout: Duration::from_secs(3),
            routing_budget: Duration::from_secs(5),
            retry_unavailable: true,
            max_output_tokens: 512,
            body_excerpt_chars: 1500,
        }
    }
}

/// Workflow orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum steps running at once in parallel mode.
    pub max_concurrency: usize,
    /// Timeout for steps that don't declare one.
    pub default_step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_step_timeout: Duration::from_secs(30),
        }
    }
}

/// Session state persistence configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Optimistic write attempts before giving up.
    pub max_merge_attempts: u32,
    /// Expiry for stored session state.
    pub state_ttl: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_merge_attempts: 3,
            state_ttl: Some(Duration::from_secs(30 * 24 * 3600)), // 30 days
        }
    }
}

/// Intake pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long processed-message markers are kept for deduplication.
    pub dedup_ttl: Duration,
    /// Run multi-step workflows for messages that warrant one.
    pub enable_workflows: bool,
    /// Send an acknowledgment reply through the delivery adapter.
    pub auto_acknowledge: bool,
    /// Bound on the identity-minting call.
    pub identity_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: Duration::from_secs(7 * 24 * 3600), // 7 days
            enable_workflows: true,
            auto_acknowledge: false,
            identity_timeout: Duration::from_secs(2),
        }
    }
}

/// Batch consumer configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Attempts per item before it is reported failed.
    pub max_attempts: u32,
    /// Base delay between attempts (jittered).
    pub retry_backoff: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Telemetry flusher configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Bounded channel capacity; events beyond it are dropped.
    pub channel_capacity: usize,
    /// Flush when this many events are buffered.
    pub flush_batch_size: usize,
    /// Flush at least this often when anything is buffered.
    pub flush_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            flush_batch_size: 64,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Owner id for this instance's vector clocks.
    pub node_id: String,
    pub routing: RoutingConfig,
    pub orchestrator: OrchestratorConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub batch: BatchConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", Uuid::new_v4().simple()),
            routing: RoutingConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            session: SessionConfig::default(),
            pipeline: PipelineConfig::default(),
            batch: BatchConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Build from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(node_id) = lookup("INTAKE_NODE_ID").filter(|s| !s.trim().is_empty()) {
            config.node_id = node_id.trim().to_string();
        }

        let threshold: f32 = parse(&lookup, "INTAKE_CONFIDENCE_THRESHOLD")?
            .unwrap_or(config.routing.confidence_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_CONFIDENCE_THRESHOLD".into(),
                message: format!("{threshold} is outside [0, 1]"),
            });
        }
        config.routing.confidence_threshold = threshold;

        if let Some(ms) = parse::<u64, _>(&lookup, "INTAKE_INFERENCE_TIMEOUT_MS")? {
            config.routing.inference_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "INTAKE_ROUTING_BUDGET_MS")? {
            config.routing.routing_budget = Duration::from_millis(ms);
        }
        if let Some(retry) = parse_bool(&lookup, "INTAKE_INFERENCE_RETRY")? {
            config.routing.retry_unavailable = retry;
        }
        if let Some(n) = parse::<usize, _>(&lookup, "INTAKE_MAX_CONCURRENT_STEPS")? {
            if n == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "INTAKE_MAX_CONCURRENT_STEPS".into(),
                    message: "must be at least 1".into(),
                });
            }
            config.orchestrator.max_concurrency = n;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, "INTAKE_STEP_TIMEOUT_MS")? {
            config.orchestrator.default_step_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32, _>(&lookup, "INTAKE_MERGE_ATTEMPTS")? {
            config.session.max_merge_attempts = n.max(1);
        }
        if let Some(n) = parse::<u32, _>(&lookup, "INTAKE_BATCH_ATTEMPTS")? {
            config.batch.max_attempts = n.max(1);
        }
        if let Some(enabled) = parse_bool(&lookup, "INTAKE_WORKFLOWS")? {
            config.pipeline.enable_workflows = enabled;
        }
        if let Some(ack) = parse_bool(&lookup, "INTAKE_AUTO_ACK")? {
            config.pipeline.auto_acknowledge = ack;
        }

        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}

fn parse_bool<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{v:?} is not a boolean"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = GatewayConfig::from_lookup(|_| None).unwrap();
        assert!((config.routing.confidence_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.orchestrator.max_concurrency, 4);
        assert!(config.node_id.starts_with("node-"));
        assert!(!config.pipeline.auto_acknowledge);
    }

    #[test]
    fn overrides_from_env() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("INTAKE_NODE_ID", "gw-1"),
            ("INTAKE_CONFIDENCE_THRESHOLD", "0.55"),
            ("INTAKE_INFERENCE_TIMEOUT_MS", "750"),
            ("INTAKE_WORKFLOWS", "off"),
            ("INTAKE_MAX_CONCURRENT_STEPS", "8"),
        ]))
        .unwrap();
        assert_eq!(config.node_id, "gw-1");
        assert!((config.routing.confidence_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.routing.inference_timeout, Duration::from_millis(750));
        assert!(!config.pipeline.enable_workflows);
        assert_eq!(config.orchestrator.max_concurrency, 8);
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[("INTAKE_CONFIDENCE_THRESHOLD", "1.5")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "INTAKE_CONFIDENCE_THRESHOLD"));
    }

    #[test]
    fn garbage_number_rejected() {
        let err = GatewayConfig::from_lookup(lookup(&[("INTAKE_ROUTING_BUDGET_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("INTAKE_ROUTING_BUDGET_MS"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(
            GatewayConfig::from_lookup(lookup(&[("INTAKE_MAX_CONCURRENT_STEPS", "0")])).is_err()
        );
    }

    #[test]
    fn bad_boolean_rejected() {
        assert!(GatewayConfig::from_lookup(lookup(&[("INTAKE_AUTO_ACK", "maybe")])).is_err());
    }
}
