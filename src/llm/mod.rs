//! LLM integration for the intake gateway.
//!
//! The inference call is the only operation in the routing path that may
//! suspend. Callers race it against a timeout and treat every response as
//! untrusted text.

pub mod anthropic;
mod costs;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use costs::{default_cost, model_cost};
pub use provider::*;

use std::sync::Arc;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default model when `INTAKE_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
    pub base_url: Option<String>,
}

impl LlmConfig {
    /// Read `ANTHROPIC_API_KEY`, `INTAKE_MODEL`, and `INTAKE_LLM_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        let model = std::env::var("INTAKE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            backend: LlmBackend::Anthropic,
            api_key: SecretString::from(api_key),
            model,
            base_url: std::env::var("INTAKE_LLM_BASE_URL").ok(),
        })
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn LlmProvider> {
    match config.backend {
        LlmBackend::Anthropic => {
            let mut provider = AnthropicProvider::new(config.api_key.clone(), &config.model);
            if let Some(ref url) = config.base_url {
                provider = provider.with_base_url(url);
            }
            tracing::info!("Using Anthropic (model: {})", config.model);
            Arc::new(provider)
        }
    }
}
