//! Capability registry.
//!
//! Capabilities are registered as factories keyed by name. The orchestrator
//! resolves the whole registry once, at construction, into a
//! `CapabilityTable`; per-step dispatch is a map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CapabilityError, WorkflowError};

/// Input handed to a capability.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub task_id: String,
    pub task_type: String,
    pub step: String,
    /// The task's context payload.
    pub context: serde_json::Value,
    /// Outputs of steps that succeeded before this one was scheduled.
    pub results: serde_json::Map<String, serde_json::Value>,
}

/// A handler for one named capability.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Capability name.
    fn name(&self) -> &str;

    /// Execute against one step's input.
    async fn execute(&self, input: StepInput) -> Result<serde_json::Value, CapabilityError>;
}

/// Constructor for a capability.
pub type CapabilityFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync>;

/// Wrap a closure as a `CapabilityFactory`.
pub fn factory<F>(f: F) -> CapabilityFactory
where
    F: Fn() -> Result<Arc<dyn Capability>, CapabilityError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Registry of capability factories.
#[derive(Default)]
pub struct CapabilityRegistry {
    factories: HashMap<String, CapabilityFactory>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later registration under the same name replaces
    /// the earlier one.
    pub fn register(&mut self, name: impl Into<String>, factory: CapabilityFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::debug!(capability = %name, "Replaced capability factory");
        } else {
            tracing::debug!(capability = %name, "Registered capability");
        }
    }

    /// Register an already-built capability under its own name.
    pub fn register_instance(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        self.register(name, factory(move || Ok(capability.clone())));
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.factories.len()
    }

    /// Run every factory once. Factory failures are kept so the steps that
    /// need them fail with the init error.
    pub fn resolve(&self) -> CapabilityTable {
        let mut handlers = HashMap::new();
        let mut init_failures = HashMap::new();
        for (name, factory) in &self.factories {
            match factory() {
                Ok(handler) => {
                    handlers.insert(name.clone(), handler);
                }
                Err(e) => {
                    tracing::warn!(capability = %name, error = %e, "Capability failed to initialize");
                    init_failures.insert(name.clone(), e.to_string());
                }
            }
        }
        CapabilityTable {
            handlers,
            init_failures,
        }
    }
}

/// Resolved capabilities.
pub struct CapabilityTable {
    handlers: HashMap<String, Arc<dyn Capability>>,
    init_failures: HashMap<String, String>,
}

impl CapabilityTable {
    pub fn get(&self, name: &str) -> Result<Arc<dyn Capability>, WorkflowError> {
        if let Some(handler) = self.handlers.get(name) {
            return Ok(handler.clone());
        }
        match self.init_failures.get(name) {
            Some(reason) => Err(WorkflowError::CapabilityInit {
                capability: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(WorkflowError::CapabilityResolution {
                capability: name.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
