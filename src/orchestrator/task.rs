//! Task definitions and workflow results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::state::{TaskLifecycle, TaskState};

/// How a task's steps are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time, in declared order.
    #[default]
    Sequential,
    /// Steps whose dependencies are satisfied run together, bounded by the
    /// orchestrator's concurrency cap.
    Parallel,
}

/// One step of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Unique within the task; a later step reusing a name fails without
    /// running.
    pub name: String,
    /// Capability name resolved against the capability table.
    pub capability: String,
    /// A failed critical step fails the task.
    #[serde(default)]
    pub critical: bool,
    /// Overrides the orchestrator's default step timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Steps whose output this step consumes.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl AgentStep {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            critical: false,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }
}

/// A unit of orchestrated work. Read-only during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub task_type: String,
    /// Arbitrary payload handed to every step.
    pub context: serde_json::Value,
    pub steps: Vec<AgentStep>,
    #[serde(default)]
    pub mode: ExecutionMode,
}

impl AgentTask {
    pub fn new(task_type: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            context,
            steps: Vec::new(),
            mode: ExecutionMode::Sequential,
        }
    }

    pub fn step(mut self, step: AgentStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What happened to one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    /// Not run: a dependency failed or a critical step halted the task.
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub capability: String,
    pub status: StepStatus,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn succeeded(step: &AgentStep, output: serde_json::Value, duration: Duration) -> Self {
        Self {
            step: step.name.clone(),
            capability: step.capability.clone(),
            status: StepStatus::Succeeded,
            critical: step.critical,
            output: Some(output),
            error: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn unsuccessful(
        step: &AgentStep,
        status: StepStatus,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            step: step.name.clone(),
            capability: step.capability.clone(),
            status,
            critical: step.critical,
            output: None,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Final result of a task. Failure is expressed here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    /// One outcome per declared step, in declared order.
    pub steps: Vec<StepOutcome>,
    pub completed_steps: usize,
    pub total_steps: usize,
    /// `completed_steps / total_steps`; 1.0 for a task with no steps.
    pub success_rate: f64,
    pub recommendations: Vec<String>,
    /// Outputs of successful steps keyed by step name.
    pub results: serde_json::Map<String, serde_json::Value>,
    pub lifecycle: TaskLifecycle,
}

/// Why the task stopped early, if it did.
#[derive(Debug, Clone)]
pub enum Halt {
    CriticalFailure { step: String, reason: String },
    Cancelled,
}

impl WorkflowResult {
    /// Build the final result from the recorded outcomes and move the
    /// lifecycle to its terminal state.
    pub fn finish(
        task: &AgentTask,
        steps: Vec<StepOutcome>,
        results: serde_json::Map<String, serde_json::Value>,
        halt: Option<Halt>,
        mut lifecycle: TaskLifecycle,
    ) -> Self {
        let total_steps = task.steps.len();
        let completed_steps = steps.iter().filter(|s| s.status.is_success()).count();
        let success_rate = if total_steps == 0 {
            1.0
        } else {
            completed_steps as f64 / total_steps as f64
        };

        let mut recommendations = Vec::new();
        let state = match halt {
            Some(Halt::CriticalFailure { ref step, ref reason }) => {
                recommendations.push(format!(
                    "Review and retry: critical step '{step}' failed ({reason})"
                ));
                TaskState::Failed
            }
            Some(Halt::Cancelled) => {
                recommendations
                    .push("Review and retry: task was cancelled before completion".to_string());
                TaskState::Failed
            }
            None if completed_steps == total_steps => TaskState::Complete,
            None => TaskState::Partial,
        };

        for outcome in steps.iter().filter(|s| !s.status.is_success() && !s.critical) {
            if outcome.status == StepStatus::Cancelled {
                continue;
            }
            recommendations.push(format!(
                "Step '{}' did not complete ({}); its output is missing from the result",
                outcome.step,
                outcome.error.as_deref().unwrap_or("no detail")
            ));
        }

        let reason = format!("{completed_steps}/{total_steps} steps succeeded");
        if let Err(e) = lifecycle.transition_to(state, Some(reason)) {
            tracing::warn!(task_id = %task.id, error = %e, "Unexpected task transition");
            lifecycle.state = state;
        }

        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            state,
            steps,
            completed_steps,
            total_steps,
            success_rate,
            recommendations,
            results,
            lifecycle,
        }
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }
}
