//! Intake pipeline — the composition root.
//!
//! Flow per message:
//! 1. Deduplicate on `processed:<id>`
//! 2. `RoutingEngine::route()` — AI first, rules as fallback
//! 3. Mint an intake identifier (local fallback on failure)
//! 4. Plan and run a workflow for messages that warrant one
//! 5. Record the message in its session (VectorClock-guarded)
//! 6. Forward, and optionally acknowledge
//! 7. Mark the message processed once it was forwarded
//!
//! Nothing after routing can undo the routing decision. Storage, delivery and
//! workflow problems are logged and reported on the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::delivery::{DeliveryAdapter, ReplySpec};
use crate::config::{GatewayConfig, PipelineConfig};
use crate::error::{PipelineError, StorageError};
use crate::identity::{IdentityMinter, MintedId, mint_or_fallback};
use crate::llm::provider::LlmProvider;
use crate::orchestrator::builtin::{
    ATTACHMENT_ANALYSIS, CASE_SUMMARY, DEADLINE_EXTRACTION, DOCUMENT_ANALYSIS, DRAFT_RESPONSE,
    RECIPIENT_CONFIRMATION, register_default_capabilities,
};
use crate::orchestrator::capability::CapabilityRegistry;
use crate::orchestrator::engine::Orchestrator;
use crate::orchestrator::task::{AgentStep, AgentTask, WorkflowResult};
use crate::pipeline::engine::RoutingEngine;
use crate::pipeline::ingest::parse_rfc822;
use crate::pipeline::types::{Category, Message, Priority, RoutingDecision};
use crate::store::session::{MergeOutcome, SessionState, SessionStore};
use crate::store::traits::{MESSAGE_PREFIX, PROCESSED_PREFIX, StateStore, get_json, put_json};
use crate::telemetry::{TelemetryEvent, TelemetryHandle};

/// Entity type passed to the identity authority.
pub const INTAKE_ENTITY: &str = "intake";

/// What is remembered about a processed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub decision: RoutingDecision,
    pub intake_id: MintedId,
    pub processed_at: DateTime<Utc>,
}

/// Result of processing one message. Always produced, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct IntakeOutcome {
    pub decision: RoutingDecision,
    pub intake_id: MintedId,
    /// Present when a workflow was planned and run.
    pub workflow: Option<WorkflowResult>,
    /// Session the message was recorded in.
    pub session_id: Option<String>,
    /// The message had already been processed; nothing was re-run.
    pub duplicate: bool,
    pub forwarded: bool,
    /// Non-fatal problems encountered after routing.
    pub issues: Vec<String>,
}

/// Build the workflow a routed message warrants, if any.
pub fn plan_workflow(message: &Message, decision: &RoutingDecision) -> Option<AgentTask> {
    let classification = &decision.classification;
    let context = json!({
        "message_id": decision.message_id,
        "sender": message.sender,
        "recipient": message.recipient,
        "subject": message.subject,
        "body": message.body,
        "attachments": message.attachments,
        "category": classification.category.as_str(),
        "priority": classification.priority.as_str(),
        "primary_destination": decision.primary_destination,
    });

    let confirm = AgentStep::new(RECIPIENT_CONFIRMATION, RECIPIENT_CONFIRMATION).critical();
    let task = match classification.category {
        Category::Lawsuit | Category::Emergency => AgentTask::new("case_intake", context)
            .step(confirm)
            .step(AgentStep::new(DEADLINE_EXTRACTION, DEADLINE_EXTRACTION))
            .step(AgentStep::new(ATTACHMENT_ANALYSIS, ATTACHMENT_ANALYSIS))
            .step(AgentStep::new(CASE_SUMMARY, CASE_SUMMARY))
            .step(AgentStep::new(DRAFT_RESPONSE, DRAFT_RESPONSE).depends_on(CASE_SUMMARY)),
        Category::DocumentSubmission => AgentTask::new("document_intake", context)
            .step(confirm)
            .step(AgentStep::new(DOCUMENT_ANALYSIS, DOCUMENT_ANALYSIS))
            .step(AgentStep::new(DRAFT_RESPONSE, DRAFT_RESPONSE).depends_on(DOCUMENT_ANALYSIS)),
        _ if classification.priority >= Priority::High => {
            AgentTask::new("priority_intake", context)
                .step(AgentStep::new(CASE_SUMMARY, CASE_SUMMARY))
                .step(AgentStep::new(DRAFT_RESPONSE, DRAFT_RESPONSE).depends_on(CASE_SUMMARY))
        }
        _ => return None,
    };
    Some(task)
}

/// Session a message belongs to: its case when one was detected, otherwise
/// its sender.
pub fn session_key(message: &Message, decision: &RoutingDecision) -> Option<String> {
    if decision.primary_destination.starts_with("case-") {
        return Some(decision.primary_destination.clone());
    }
    let sender = message.sender.trim().to_lowercase();
    if sender.is_empty() {
        None
    } else {
        Some(format!("sender-{sender}"))
    }
}

/// Intake pipeline.
pub struct IntakePipeline {
    engine: RoutingEngine,
    orchestrator: Orchestrator,
    sessions: SessionStore,
    store: Arc<dyn StateStore>,
    delivery: Arc<dyn DeliveryAdapter>,
    minter: Arc<dyn IdentityMinter>,
    telemetry: TelemetryHandle,
    config: PipelineConfig,
    node_id: String,
}

impl IntakePipeline {
    /// Wire up a pipeline with the built-in capabilities.
    pub fn new(
        config: &GatewayConfig,
        llm: Option<Arc<dyn LlmProvider>>,
        store: Arc<dyn StateStore>,
        delivery: Arc<dyn DeliveryAdapter>,
        minter: Arc<dyn IdentityMinter>,
        telemetry: TelemetryHandle,
    ) -> Result<Self, PipelineError> {
        let mut registry = CapabilityRegistry::new();
        register_default_capabilities(&mut registry, llm.clone());
        let orchestrator = Orchestrator::new(&registry, config.orchestrator.clone());
        let engine = RoutingEngine::new(llm, config.routing.clone())?;

        info!(
            node = %config.node_id,
            capabilities = registry.count(),
            delivery = delivery.name(),
            "Intake pipeline ready"
        );

        Ok(Self {
            engine,
            orchestrator,
            sessions: SessionStore::new(Arc::clone(&store), &config.node_id, &config.session),
            store,
            delivery,
            minter,
            telemetry,
            config: config.pipeline.clone(),
            node_id: config.node_id.clone(),
        })
    }

    /// Replace the workflow engine (e.g. with a custom capability table).
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Decode raw mail and process it. Undecodable bytes are routed as
    /// corrupt input.
    pub async fn process_raw(&self, raw: &[u8]) -> IntakeOutcome {
        match parse_rfc822(raw) {
            Ok(message) => self.process(message).await,
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Raw message could not be decoded");
                let mut outcome = self.process(Message::new("", "", "", "")).await;
                outcome.issues.push(e.to_string());
                outcome
            }
        }
    }

    /// Process a single inbound message end to end.
    pub async fn process(&self, mut message: Message) -> IntakeOutcome {
        if message.id.trim().is_empty() {
            message.id = Uuid::new_v4().to_string();
        }
        let mut issues = Vec::new();

        match self.processed(&message.id).await {
            Ok(Some(record)) => {
                info!(id = %message.id, "Duplicate message, returning stored decision");
                self.telemetry.emit(TelemetryEvent::DuplicateSkipped {
                    message_id: message.id.clone(),
                });
                return IntakeOutcome {
                    session_id: session_key(&message, &record.decision),
                    decision: record.decision,
                    intake_id: record.intake_id,
                    workflow: None,
                    duplicate: true,
                    forwarded: false,
                    issues,
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(id = %message.id, error = %e, "Dedup lookup failed, processing anyway");
                issues.push(format!("dedup lookup: {e}"));
            }
        }

        info!(
            id = %message.id,
            sender = %message.sender,
            attachments = message.attachments.len(),
            "Processing inbound message"
        );

        if let Err(e) = put_json(
            self.store.as_ref(),
            &format!("{MESSAGE_PREFIX}{}", message.id),
            &message,
            Some(self.config.dedup_ttl),
        )
        .await
        {
            warn!(id = %message.id, error = %e, "Failed to park message");
            issues.push(format!("store message: {e}"));
        }

        let decision = self.engine.route(&message).await;
        self.telemetry.emit(TelemetryEvent::MessageRouted {
            message_id: decision.message_id.clone(),
            category: decision.classification.category.to_string(),
            priority: decision.classification.priority.as_str().to_string(),
            destination: decision.primary_destination.clone(),
            source: decision.source.label().to_string(),
            is_fallback: decision.is_fallback,
            cost: decision.cost,
        });

        let intake_id = mint_or_fallback(
            self.minter.as_ref(),
            INTAKE_ENTITY,
            &self.node_id,
            &decision.message_id,
            self.config.identity_timeout,
        )
        .await;

        let workflow = self.run_workflow(&message, &decision).await;

        let session_id = session_key(&message, &decision);
        if let Some(ref sid) = session_id
            && let Err(e) = self.record_in_session(sid, &decision, &intake_id).await
        {
            warn!(id = %decision.message_id, session = %sid, error = %e, "Session update failed");
            issues.push(format!("session: {e}"));
        }

        let forwarded = match self.delivery.forward(&decision).await {
            Ok(()) => true,
            Err(e) => {
                warn!(id = %decision.message_id, error = %e, "Forward failed");
                self.telemetry.emit(TelemetryEvent::DeliveryFailed {
                    message_id: decision.message_id.clone(),
                    reason: e.to_string(),
                });
                issues.push(e.to_string());
                false
            }
        };

        if self.config.auto_acknowledge && !message.sender.trim().is_empty() {
            let ack = ReplySpec::acknowledgment(&message, &decision);
            if let Err(e) = self.delivery.reply(&ack).await {
                warn!(id = %decision.message_id, error = %e, "Acknowledgment failed");
                issues.push(e.to_string());
            }
        }

        // Only a forwarded message counts as processed; redelivery retries it.
        if forwarded {
            let record = ProcessedRecord {
                decision: decision.clone(),
                intake_id: intake_id.clone(),
                processed_at: Utc::now(),
            };
            if let Err(e) = put_json(
                self.store.as_ref(),
                &format!("{PROCESSED_PREFIX}{}", decision.message_id),
                &record,
                Some(self.config.dedup_ttl),
            )
            .await
            {
                warn!(id = %decision.message_id, error = %e, "Failed to record processed marker");
                issues.push(format!("processed marker: {e}"));
            }
        }

        info!(
            id = %decision.message_id,
            category = %decision.classification.category,
            priority = decision.classification.priority.as_str(),
            destination = %decision.primary_destination,
            source = decision.source.label(),
            fallback = decision.is_fallback,
            intake_id = %intake_id.id,
            "Message routed"
        );

        IntakeOutcome {
            decision,
            intake_id,
            workflow,
            session_id,
            duplicate: false,
            forwarded,
            issues,
        }
    }

    /// Reconcile session state received from another instance.
    pub async fn receive_session(&self, remote: SessionState) -> Result<MergeOutcome, StorageError> {
        let session_id = remote.session_id.clone();
        let outcome = self.sessions.receive(remote).await?;
        if let MergeOutcome::Merged { conflicts } = outcome
            && conflicts > 0
        {
            self.telemetry
                .emit(TelemetryEvent::SessionConflict { session_id, conflicts });
        }
        Ok(outcome)
    }

    async fn processed(&self, message_id: &str) -> Result<Option<ProcessedRecord>, StorageError> {
        get_json(
            self.store.as_ref(),
            &format!("{PROCESSED_PREFIX}{message_id}"),
        )
        .await
    }

    async fn run_workflow(
        &self,
        message: &Message,
        decision: &RoutingDecision,
    ) -> Option<WorkflowResult> {
        if !self.config.enable_workflows {
            return None;
        }
        let task = plan_workflow(message, decision)?;
        debug!(
            id = %decision.message_id,
            task_type = %task.task_type,
            steps = task.steps.len(),
            "Workflow planned"
        );
        let result = self.orchestrator.execute_task(&task).await;
        self.telemetry.emit(TelemetryEvent::WorkflowFinished {
            task_id: result.task_id.clone(),
            task_type: result.task_type.clone(),
            state: result.state.to_string(),
            completed: result.completed_steps,
            total: result.total_steps,
            success_rate: result.success_rate,
        });
        Some(result)
    }

    async fn record_in_session(
        &self,
        session_id: &str,
        decision: &RoutingDecision,
        intake_id: &MintedId,
    ) -> Result<SessionState, StorageError> {
        let category = json!(decision.classification.category.as_str());
        let priority = json!(decision.classification.priority.as_str());
        let destination = json!(decision.primary_destination);
        let intake = json!(intake_id.id);
        self.sessions
            .apply(session_id, |state| {
                state.record_message(decision.message_id.clone());
                state.set_field("category", category.clone());
                state.set_field("priority", priority.clone());
                state.set_field("destination", destination.clone());
                state.set_field("last_intake_id", intake.clone());
            })
            .await
    }
}
