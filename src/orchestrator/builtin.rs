//! Built-in capabilities.
//!
//! Deterministic checks run without a model. The analysis and drafting
//! capabilities are registered only when an inference provider is
//! configured; without one, steps that need them fail to resolve.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::error::CapabilityError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::orchestrator::capability::{Capability, CapabilityRegistry, StepInput, factory};

pub const RECIPIENT_CONFIRMATION: &str = "recipient_confirmation";
pub const DEADLINE_EXTRACTION: &str = "deadline_extraction";
pub const ATTACHMENT_ANALYSIS: &str = "attachment_analysis";
pub const DOCUMENT_ANALYSIS: &str = "document_analysis";
pub const CASE_SUMMARY: &str = "case_summary";
pub const DRAFT_RESPONSE: &str = "draft_response";

/// Attachments above this size are flagged.
const OVERSIZED_BYTES: u64 = 25 * 1024 * 1024;

/// Register every built-in capability.
pub fn register_default_capabilities(
    registry: &mut CapabilityRegistry,
    llm: Option<Arc<dyn LlmProvider>>,
) {
    registry.register_instance(Arc::new(RecipientConfirmation));
    registry.register_instance(Arc::new(AttachmentAnalysis));
    registry.register(
        DEADLINE_EXTRACTION,
        factory(|| {
            DeadlineExtraction::new()
                .map(|c| Arc::new(c) as Arc<dyn Capability>)
                .map_err(|e| CapabilityError::InitFailed(e.to_string()))
        }),
    );

    let Some(llm) = llm else {
        tracing::info!("No inference provider; analysis and drafting capabilities not registered");
        return;
    };
    for (name, instructions) in [
        (
            DOCUMENT_ANALYSIS,
            "Summarize what the attached or enclosed documents are and what action they require.",
        ),
        (
            CASE_SUMMARY,
            "Summarize the matter in three sentences: parties, posture, and what is being asked.",
        ),
        (
            DRAFT_RESPONSE,
            "Draft a short, professional acknowledgment to the sender. Do not give legal advice.",
        ),
    ] {
        registry.register_instance(Arc::new(LlmCapability::new(name, instructions, llm.clone())));
    }
}

fn context_str<'a>(input: &'a StepInput, key: &str) -> &'a str {
    input.context.get(key).and_then(Value::as_str).unwrap_or("")
}

// ── Recipient confirmation ──────────────────────────────────────────

/// Confirms the message has a well-formed recipient and a routing target.
pub struct RecipientConfirmation;

fn valid_address(addr: &str) -> bool {
    let mut parts = addr.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

#[async_trait]
impl Capability for RecipientConfirmation {
    fn name(&self) -> &str {
        RECIPIENT_CONFIRMATION
    }

    async fn execute(&self, input: StepInput) -> Result<Value, CapabilityError> {
        let recipient = context_str(&input, "recipient").trim();
        if !valid_address(recipient) {
            return Err(CapabilityError::InvalidInput(format!(
                "recipient '{recipient}' is not a deliverable address"
            )));
        }
        let destination = context_str(&input, "primary_destination");
        if destination.is_empty() {
            return Err(CapabilityError::InvalidInput(
                "no routing destination".into(),
            ));
        }
        Ok(json!({
            "recipient": recipient.to_lowercase(),
            "destination": destination,
            "confirmed": true,
        }))
    }
}

// ── Deadline extraction ─────────────────────────────────────────────

/// Pulls date and deadline phrases out of the subject and body.
pub struct DeadlineExtraction {
    patterns: Vec<Regex>,
}

impl DeadlineExtraction {
    pub fn new() -> Result<Self, regex::Error> {
        let patterns = [
            r"\b\d{1,2}/\d{1,2}/\d{2,4}\b",
            r"\b\d{4}-\d{2}-\d{2}\b",
            r"(?i)\b(jan(uary)?|feb(ruary)?|mar(ch)?|apr(il)?|may|june?|july?|aug(ust)?|sep(tember)?|oct(ober)?|nov(ember)?|dec(ember)?)\.? \d{1,2}(st|nd|rd|th)?(, \d{4})?\b",
            r"(?i)\bwithin \d+ (business |calendar )?days\b",
            r"(?i)\b(by|before|no later than) (monday|tuesday|wednesday|thursday|friday|saturday|sunday|tomorrow|end of (day|week))\b",
        ]
        .into_iter()
        .map(Regex::new)
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut found: Vec<(usize, String)> = Vec::new();
        for re in &self.patterns {
            for m in re.find_iter(text) {
                if !found.iter().any(|(_, s)| s == m.as_str()) {
                    found.push((m.start(), m.as_str().to_string()));
                }
            }
        }
        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, s)| s).collect()
    }
}

#[async_trait]
impl Capability for DeadlineExtraction {
    fn name(&self) -> &str {
        DEADLINE_EXTRACTION
    }

    async fn execute(&self, input: StepInput) -> Result<Value, CapabilityError> {
        let text = format!(
            "{}\n{}",
            context_str(&input, "subject"),
            context_str(&input, "body")
        );
        let deadlines = self.extract(&text);
        Ok(json!({ "count": deadlines.len(), "deadlines": deadlines }))
    }
}

// ── Attachment analysis ─────────────────────────────────────────────

/// Inventories attachment descriptors; flags oversized or unusual types.
pub struct AttachmentAnalysis;

fn supported_media_type(media_type: &str) -> bool {
    let mt = media_type.to_lowercase();
    mt.starts_with("image/")
        || mt.starts_with("text/")
        || matches!(
            mt.as_str(),
            "application/pdf"
                | "application/msword"
                | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                | "application/rtf"
        )
}

#[async_trait]
impl Capability for AttachmentAnalysis {
    fn name(&self) -> &str {
        ATTACHMENT_ANALYSIS
    }

    async fn execute(&self, input: StepInput) -> Result<Value, CapabilityError> {
        let attachments = match input.context.get("attachments") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(CapabilityError::InvalidInput(
                    "attachments must be a list".into(),
                ));
            }
        };

        let mut total_bytes = 0u64;
        let mut flagged = Vec::new();
        for a in &attachments {
            let name = a.get("name").and_then(Value::as_str).unwrap_or("unnamed");
            let size = a.get("size").and_then(Value::as_u64).unwrap_or(0);
            let media_type = a.get("media_type").and_then(Value::as_str).unwrap_or("");
            total_bytes += size;
            if size > OVERSIZED_BYTES {
                flagged.push(format!("{name}: oversized ({size} bytes)"));
            }
            if !supported_media_type(media_type) {
                flagged.push(format!("{name}: unsupported type '{media_type}'"));
            }
        }

        Ok(json!({
            "count": attachments.len(),
            "total_bytes": total_bytes,
            "flagged": flagged,
        }))
    }
}

// ── LLM-backed capabilities ─────────────────────────────────────────

/// Runs a fixed instruction against the task context and earlier results.
pub struct LlmCapability {
    name: String,
    instructions: String,
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
}

impl LlmCapability {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            llm,
            max_tokens: 600,
        }
    }

    fn build_prompt(&self, input: &StepInput) -> String {
        let mut prompt = String::with_capacity(1024);
        prompt.push_str(&format!("Task: {}\n", input.task_type));
        prompt.push_str(&format!("From: {}\n", context_str(input, "sender")));
        prompt.push_str(&format!("Subject: {}\n", context_str(input, "subject")));
        if let Some(category) = input.context.get("category").and_then(Value::as_str) {
            prompt.push_str(&format!("Category: {category}\n"));
        }
        let body: String = context_str(input, "body").chars().take(2000).collect();
        prompt.push_str(&format!("\nMessage:\n{body}\n"));
        if !input.results.is_empty() {
            prompt.push_str("\nEarlier findings:\n");
            for (step, output) in &input.results {
                prompt.push_str(&format!("- {step}: {output}\n"));
            }
        }
        prompt
    }
}

#[async_trait]
impl Capability for LlmCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: StepInput) -> Result<Value, CapabilityError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.instructions.clone()),
            ChatMessage::user(self.build_prompt(&input)),
        ])
        .with_max_tokens(self.max_tokens)
        .with_temperature(0.2);

        let response = self.llm.complete(request).await?;
        let text = response.content.trim();
        if text.is_empty() {
            return Err(CapabilityError::ExecutionFailed("empty model output".into()));
        }
        Ok(json!({
            "text": text,
            "model": self.llm.model_name(),
            "cost": self.llm.cost_of(&response).to_string(),
        }))
    }
}
