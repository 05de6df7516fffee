//! Multi-step workflow orchestration.

pub mod builtin;
pub mod capability;
pub mod engine;
pub mod state;
pub mod task;

pub use capability::{Capability, CapabilityRegistry, StepInput};
pub use engine::Orchestrator;
pub use state::TaskState;
pub use task::{AgentStep, AgentTask, ExecutionMode, StepStatus, WorkflowResult};
