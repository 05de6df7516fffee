//! Workflow orchestrator.
//!
//! Executes an `AgentTask` step by step. A failed step is recorded and the
//! task moves on, unless the step is critical, in which case nothing further
//! is scheduled and the task ends FAILED. Every declared step gets an outcome.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::WorkflowError;
use crate::orchestrator::capability::{CapabilityRegistry, CapabilityTable, StepInput};
use crate::orchestrator::state::{TaskLifecycle, TaskState};
use crate::orchestrator::task::{
    AgentStep, AgentTask, ExecutionMode, Halt, StepOutcome, StepStatus, WorkflowResult,
};

type Results = serde_json::Map<String, serde_json::Value>;

/// Executes tasks against a capability table resolved at construction.
pub struct Orchestrator {
    table: CapabilityTable,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
}

/// Bookkeeping for one execution.
struct Run {
    outcomes: Vec<Option<StepOutcome>>,
    results: Results,
    halt: Option<Halt>,
}

impl Run {
    /// Steps reusing an earlier step's name are failed up front; dependencies
    /// on that name resolve to the first declaration.
    fn new(task: &AgentTask) -> Self {
        let mut run = Self {
            outcomes: vec![None; task.steps.len()],
            results: Results::new(),
            halt: None,
        };
        let mut seen = HashSet::new();
        for (index, step) in task.steps.iter().enumerate() {
            if seen.insert(step.name.as_str()) {
                continue;
            }
            let err = WorkflowError::DuplicateStep {
                step: step.name.clone(),
            };
            warn!(task_id = %task.id, step = %step.name, "Duplicate step name, not running it");
            run.record(
                index,
                step,
                StepOutcome::unsuccessful(step, StepStatus::Failed, err.to_string(), Default::default()),
            );
        }
        run
    }

    fn record(&mut self, index: usize, step: &AgentStep, outcome: StepOutcome) {
        match outcome.status {
            StepStatus::Succeeded => {
                if let Some(ref output) = outcome.output {
                    self.results.insert(step.name.clone(), output.clone());
                }
            }
            StepStatus::Cancelled => {
                self.halt.get_or_insert(Halt::Cancelled);
            }
            _ if step.critical => {
                let reason = outcome.error.clone().unwrap_or_default();
                let err = WorkflowError::CriticalStepFailure {
                    step: step.name.clone(),
                    reason: reason.clone(),
                };
                warn!(step = %step.name, error = %err, "Critical step failed, halting task");
                self.halt.get_or_insert(Halt::CriticalFailure {
                    step: step.name.clone(),
                    reason,
                });
            }
            _ => {}
        }
        self.outcomes[index] = Some(outcome);
    }

    /// First dependency of `step` that has not succeeded, if any.
    fn unmet_dependency<'a>(&self, task: &AgentTask, step: &'a AgentStep) -> Option<&'a str> {
        step.depends_on
            .iter()
            .find(|dep| {
                let done = task
                    .steps
                    .iter()
                    .position(|s| &s.name == *dep)
                    .and_then(|i| self.outcomes[i].as_ref())
                    .is_some_and(|o| o.status.is_success());
                !done
            })
            .map(String::as_str)
    }

    /// Whether every dependency of `step` has an outcome (or doesn't exist).
    fn dependencies_settled(&self, task: &AgentTask, step: &AgentStep) -> bool {
        step.depends_on.iter().all(|dep| {
            match task.steps.iter().position(|s| &s.name == dep) {
                Some(i) => self.outcomes[i].is_some(),
                None => true,
            }
        })
    }

    fn skip_dependency(&mut self, index: usize, step: &AgentStep, dependency: &str) {
        let err = WorkflowError::DependencyFailed {
            step: step.name.clone(),
            dependency: dependency.to_string(),
        };
        debug!(step = %step.name, dependency, "Skipping step with unmet dependency");
        self.record(
            index,
            step,
            StepOutcome::unsuccessful(step, StepStatus::Skipped, err.to_string(), Default::default()),
        );
    }

    /// Outcomes in declared order; steps never reached are skipped or cancelled.
    fn into_outcomes(self, task: &AgentTask) -> (Vec<StepOutcome>, Results, Option<Halt>) {
        let halt = self.halt;
        let outcomes = self
            .outcomes
            .into_iter()
            .zip(&task.steps)
            .map(|(outcome, step)| {
                outcome.unwrap_or_else(|| match halt {
                    Some(Halt::Cancelled) => StepOutcome::unsuccessful(
                        step,
                        StepStatus::Cancelled,
                        WorkflowError::Cancelled {
                            step: step.name.clone(),
                        }
                        .to_string(),
                        Default::default(),
                    ),
                    Some(Halt::CriticalFailure { step: ref failed, .. }) => {
                        StepOutcome::unsuccessful(
                            step,
                            StepStatus::Skipped,
                            format!("not attempted: critical step {failed} failed"),
                            Default::default(),
                        )
                    }
                    None => StepOutcome::unsuccessful(
                        step,
                        StepStatus::Skipped,
                        "not attempted: unresolvable dependencies",
                        Default::default(),
                    ),
                })
            })
            .collect();
        (outcomes, self.results, halt)
    }
}

impl Orchestrator {
    /// Resolve every registered capability once and build the orchestrator.
    pub fn new(registry: &CapabilityRegistry, config: OrchestratorConfig) -> Self {
        let table = registry.resolve();
        info!(
            capabilities = table.len(),
            max_concurrency = config.max_concurrency,
            "Orchestrator ready"
        );
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            table,
            config,
        }
    }

    /// Execute a task to completion.
    pub async fn execute_task(&self, task: &AgentTask) -> WorkflowResult {
        self.execute_task_with_cancel(task, CancellationToken::new())
            .await
    }

    /// Execute a task; cancelling `cancel` drops in-flight steps and keeps
    /// every outcome recorded so far.
    pub async fn execute_task_with_cancel(
        &self,
        task: &AgentTask,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let mut lifecycle = TaskLifecycle::new();
        if let Err(e) = lifecycle.transition_to(TaskState::Running, None) {
            warn!(task_id = %task.id, error = %e, "Unexpected task transition");
        }
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            steps = task.steps.len(),
            mode = ?task.mode,
            "Task started"
        );

        let mut run = Run::new(task);
        match task.mode {
            ExecutionMode::Sequential => self.run_sequential(task, &mut run, &cancel).await,
            ExecutionMode::Parallel => self.run_parallel(task, &mut run, &cancel).await,
        }

        let (outcomes, results, halt) = run.into_outcomes(task);
        let result = WorkflowResult::finish(task, outcomes, results, halt, lifecycle);

        match result.state {
            TaskState::Complete => info!(
                task_id = %task.id,
                completed = result.completed_steps,
                "Task complete"
            ),
            state => warn!(
                task_id = %task.id,
                state = %state,
                completed = result.completed_steps,
                total = result.total_steps,
                success_rate = result.success_rate,
                "Task finished with failures"
            ),
        }
        result
    }

    async fn run_sequential(&self, task: &AgentTask, run: &mut Run, cancel: &CancellationToken) {
        for (index, step) in task.steps.iter().enumerate() {
            if run.halt.is_some() {
                break;
            }
            if cancel.is_cancelled() {
                run.halt = Some(Halt::Cancelled);
                break;
            }
            if run.outcomes[index].is_some() {
                continue;
            }
            if let Some(dep) = run.unmet_dependency(task, step) {
                run.skip_dependency(index, step, dep);
                continue;
            }
            let outcome = self.run_step(task, step, run.results.clone(), cancel).await;
            run.record(index, step, outcome);
        }
    }

    /// Run dependency waves; each wave's steps execute together under the
    /// concurrency cap.
    async fn run_parallel(&self, task: &AgentTask, run: &mut Run, cancel: &CancellationToken) {
        loop {
            if run.halt.is_some() {
                break;
            }
            if cancel.is_cancelled() {
                run.halt = Some(Halt::Cancelled);
                break;
            }

            let pending: Vec<usize> = (0..task.steps.len())
                .filter(|&i| run.outcomes[i].is_none())
                .collect();
            if pending.is_empty() {
                break;
            }

            let mut ready = Vec::new();
            let mut progressed = false;
            for index in pending {
                let step = &task.steps[index];
                if !run.dependencies_settled(task, step) {
                    continue;
                }
                match run.unmet_dependency(task, step) {
                    Some(dep) => {
                        run.skip_dependency(index, step, dep);
                        progressed = true;
                    }
                    None => ready.push(index),
                }
            }

            if ready.is_empty() {
                if progressed {
                    continue;
                }
                // Remaining steps wait on each other.
                warn!(task_id = %task.id, "Dependency cycle; remaining steps not attempted");
                break;
            }

            debug!(task_id = %task.id, wave = ready.len(), "Running step wave");
            let snapshot = run.results.clone();
            let futures = ready
                .iter()
                .map(|&i| self.run_step(task, &task.steps[i], snapshot.clone(), cancel));
            let outcomes = join_all(futures).await;
            for (index, outcome) in ready.into_iter().zip(outcomes) {
                run.record(index, &task.steps[index], outcome);
            }
        }
    }

    /// Resolve, wait for a worker slot, and execute one step under its timeout.
    async fn run_step(
        &self,
        task: &AgentTask,
        step: &AgentStep,
        results: Results,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started = Instant::now();
        let cancelled = |step: &AgentStep, started: Instant| {
            StepOutcome::unsuccessful(
                step,
                StepStatus::Cancelled,
                WorkflowError::Cancelled {
                    step: step.name.clone(),
                }
                .to_string(),
                started.elapsed(),
            )
        };

        let handler = match self.table.get(&step.capability) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(step = %step.name, error = %e, "Capability unavailable");
                return StepOutcome::unsuccessful(
                    step,
                    StepStatus::Failed,
                    e.to_string(),
                    started.elapsed(),
                );
            }
        };

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return cancelled(step, started),
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return StepOutcome::unsuccessful(
                        step,
                        StepStatus::Failed,
                        "worker pool closed",
                        started.elapsed(),
                    );
                }
            },
        };

        let timeout = step.timeout.unwrap_or(self.config.default_step_timeout);
        let input = StepInput {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            step: step.name.clone(),
            context: task.context.clone(),
            results,
        };
        debug!(step = %step.name, capability = %step.capability, "Step started");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(step = %step.name, "Step cancelled");
                cancelled(step, started)
            }
            result = tokio::time::timeout(timeout, handler.execute(input)) => match result {
                Ok(Ok(output)) => {
                    debug!(step = %step.name, elapsed_ms = started.elapsed().as_millis() as u64, "Step succeeded");
                    StepOutcome::succeeded(step, output, started.elapsed())
                }
                Ok(Err(e)) => {
                    let err = WorkflowError::StepFailed {
                        step: step.name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(error = %err, critical = step.critical, "Step failed");
                    StepOutcome::unsuccessful(step, StepStatus::Failed, err.to_string(), started.elapsed())
                }
                Err(_) => {
                    let err = WorkflowError::StepTimeout {
                        step: step.name.clone(),
                        timeout,
                    };
                    warn!(error = %err, critical = step.critical, "Step timed out");
                    StepOutcome::unsuccessful(step, StepStatus::TimedOut, err.to_string(), started.elapsed())
                }
            },
        }
    }
}
