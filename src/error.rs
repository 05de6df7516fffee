//! Error types for the intake gateway.
//!
//! Most of these never reach a caller of the pipeline: they are recovered
//! locally and turned into degraded-but-valid data (fallback routing
//! decisions, partial workflow results, locally derived identifiers).

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure modes of the AI classification path.
///
/// Every variant ends in a rule-based fallback decision; none of them is
/// surfaced to the caller of `RoutingEngine::route`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassificationError {
    #[error("inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("inference timeout after {0:?}")]
    InferenceTimeout(Duration),

    #[error("inference malformed: {0}")]
    InferenceMalformed(String),

    #[error("corrupt input: {0}")]
    CorruptInput(String),
}

impl ClassificationError {
    /// Stable short tag for the reasoning trail and logs.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::InferenceUnavailable(_) => "unavailable",
            Self::InferenceTimeout(_) => "timeout",
            Self::InferenceMalformed(_) => "malformed",
            Self::CorruptInput(_) => "corrupt_input",
        }
    }
}

/// Orchestrator errors. Recorded per step, never raised out of `execute_task`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    #[error("No handler registered for capability {capability}")]
    CapabilityResolution { capability: String },

    #[error("Handler for capability {capability} failed to initialize: {reason}")]
    CapabilityInit { capability: String, reason: String },

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Step {step} timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    #[error("Step {step} skipped: dependency {dependency} did not succeed")]
    DependencyFailed { step: String, dependency: String },

    #[error("Step {step} cancelled")]
    Cancelled { step: String },

    #[error("Step name {step} is already used by an earlier step")]
    DuplicateStep { step: String },

    #[error("Critical step {step} failed: {reason}")]
    CriticalStepFailure { step: String, reason: String },
}

/// Errors returned by capability handlers.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("Inference failed: {0}")]
    Llm(#[from] LlmError),
}

/// Storage adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Write conflict on {key} not resolved after {attempts} attempts")]
    ConflictRetriesExhausted { key: String, attempts: u32 },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Delivery adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to forward to {destination}: {reason}")]
    ForwardFailed { destination: String, reason: String },

    #[error("Failed to send reply to {recipient}: {reason}")]
    ReplyFailed { recipient: String, reason: String },
}

/// Identity-minting errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to mint {entity_type} identifier: {reason}")]
    MintFailed { entity_type: String, reason: String },

    #[error("Identity authority timed out after {0:?}")]
    Timeout(Duration),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Batch item {id} failed: {reason}")]
    ItemFailed { id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid rule pattern: {0}")]
    InvalidRule(#[from] regex::Error),
}

/// Result type alias for the gateway.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_modes_are_stable() {
        assert_eq!(
            ClassificationError::InferenceUnavailable("refused".into()).mode(),
            "unavailable"
        );
        assert_eq!(
            ClassificationError::InferenceTimeout(Duration::from_secs(3)).mode(),
            "timeout"
        );
        assert_eq!(
            ClassificationError::InferenceMalformed("no json".into()).mode(),
            "malformed"
        );
        assert_eq!(
            ClassificationError::CorruptInput("empty".into()).mode(),
            "corrupt_input"
        );
    }

    #[test]
    fn timeout_display_mentions_timeout() {
        let e = ClassificationError::InferenceTimeout(Duration::from_millis(250));
        assert!(e.to_string().contains("timeout"));
    }

    #[test]
    fn llm_error_wraps_into_capability_error() {
        let e: CapabilityError = LlmError::AuthFailed {
            provider: "anthropic".into(),
        }
        .into();
        assert!(e.to_string().contains("anthropic"));
    }
}
