//! AI classification: prompt construction and strict structured decoding.
//!
//! Heuristic recovery from free text lives in `extract`; nothing here guesses.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ClassificationError, LlmError};
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Category, Message, Priority};

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Raw model output plus what it cost.
#[derive(Debug, Clone)]
pub struct RawClassification {
    pub text: String,
    pub cost: Decimal,
}

/// A strictly decoded classification.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredClassification {
    pub category: Category,
    pub priority: Priority,
    pub confidence: f32,
    pub reasoning: String,
}

/// Calls the inference capability for a single message.
pub struct Classifier {
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
    excerpt_chars: usize,
}

impl Classifier {
    pub fn new(llm: Arc<dyn LlmProvider>, max_tokens: u32, excerpt_chars: usize) -> Self {
        Self {
            llm,
            max_tokens,
            excerpt_chars,
        }
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Build the completion request for a message.
    pub fn request(&self, message: &Message) -> CompletionRequest {
        CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(message, self.excerpt_chars)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(self.max_tokens)
    }

    /// One inference call. No timeout here; the caller races it.
    pub async fn call(&self, message: &Message) -> Result<RawClassification, ClassificationError> {
        let response = self
            .llm
            .complete(self.request(message))
            .await
            .map_err(unavailable)?;
        let cost = self.llm.cost_of(&response);
        debug!(
            id = %message.id,
            model = %self.llm.model_name(),
            output_tokens = response.output_tokens,
            cost = %cost,
            "Classification call returned"
        );
        Ok(RawClassification {
            text: response.content,
            cost,
        })
    }
}

fn unavailable(e: LlmError) -> ClassificationError {
    ClassificationError::InferenceUnavailable(e.to_string())
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    let categories: Vec<&str> = Category::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "You are the intake classifier for a law office. Classify the inbound message.\n\n\
         Categories: {}\n\
         Priorities: CRITICAL, HIGH, NORMAL, LOW\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"category\": \"...\", \"priority\": \"...\", \"confidence\": 0.0, \"reasoning\": \"...\"}}\n\n\
         Rules:\n\
         - confidence is a number between 0.0 and 1.0\n\
         - CRITICAL only for emergencies, restraining orders, subpoenas, or same-day court deadlines\n\
         - reasoning is one sentence",
        categories.join(", ")
    )
}

fn build_user_prompt(message: &Message, excerpt_chars: usize) -> String {
    let mut prompt = String::with_capacity(512);

    prompt.push_str(&format!("From: {}\n", message.sender));
    prompt.push_str(&format!("To: {}\n", message.recipient));
    prompt.push_str(&format!("Subject: {}\n", message.subject));

    if !message.attachments.is_empty() {
        prompt.push_str("Attachments:\n");
        for a in &message.attachments {
            prompt.push_str(&format!("  - {} ({}, {} bytes)\n", a.name, a.media_type, a.size));
        }
    }

    let excerpt: String = message.body.chars().take(excerpt_chars).collect();
    prompt.push_str(&format!("\nMessage:\n{}", excerpt));
    if message.body.chars().count() > excerpt_chars {
        prompt.push_str("\n[truncated]");
    }

    prompt
}

// ── Strict decoding ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassificationPayload {
    category: String,
    priority: String,
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

/// Decode model output as a structured classification. Every required field
/// must be present and valid; anything else is `InferenceMalformed`.
pub fn decode_structured(raw: &str) -> Result<StructuredClassification, ClassificationError> {
    let json_str = extract_json_object(raw);
    let payload: ClassificationPayload = serde_json::from_str(&json_str)
        .map_err(|e| ClassificationError::InferenceMalformed(format!("JSON decode: {e}")))?;

    let category = Category::parse(&payload.category).ok_or_else(|| {
        ClassificationError::InferenceMalformed(format!("unknown category '{}'", payload.category))
    })?;
    let priority = Priority::parse(&payload.priority).ok_or_else(|| {
        ClassificationError::InferenceMalformed(format!("unknown priority '{}'", payload.priority))
    })?;
    if !(0.0..=1.0).contains(&payload.confidence) {
        return Err(ClassificationError::InferenceMalformed(format!(
            "confidence {} out of range",
            payload.confidence
        )));
    }

    Ok(StructuredClassification {
        category,
        priority,
        confidence: payload.confidence,
        reasoning: payload.reasoning,
    })
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Attachment;

    #[test]
    fn decodes_plain_json() {
        let raw = r#"{"category":"lawsuit","priority":"HIGH","confidence":0.92,"reasoning":"Motion filed"}"#;
        let c = decode_structured(raw).unwrap();
        assert_eq!(c.category, Category::Lawsuit);
        assert_eq!(c.priority, Priority::High);
        assert!((c.confidence - 0.92).abs() < 1e-6);
        assert_eq!(c.reasoning, "Motion filed");
    }

    #[test]
    fn decodes_markdown_wrapped() {
        let raw = "Sure!\n```json\n{\"category\":\"billing\",\"priority\":\"low\",\"confidence\":0.8}\n```";
        let c = decode_structured(raw).unwrap();
        assert_eq!(c.category, Category::Billing);
        assert_eq!(c.priority, Priority::Low);
        assert!(c.reasoning.is_empty());
    }

    #[test]
    fn decodes_embedded_object() {
        let raw = "Result: {\"category\":\"emergency\",\"priority\":\"critical\",\"confidence\":1} done";
        assert_eq!(decode_structured(raw).unwrap().category, Category::Emergency);
    }

    #[test]
    fn missing_field_is_malformed() {
        let err = decode_structured(r#"{"category":"billing","priority":"LOW"}"#).unwrap_err();
        assert_eq!(err.mode(), "malformed");
    }

    #[test]
    fn unknown_category_is_malformed() {
        let err =
            decode_structured(r#"{"category":"spam","priority":"LOW","confidence":0.5}"#).unwrap_err();
        assert!(err.to_string().contains("unknown category"));
    }

    #[test]
    fn out_of_range_confidence_is_malformed() {
        let err = decode_structured(r#"{"category":"billing","priority":"LOW","confidence":85}"#)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn prose_is_malformed() {
        assert!(decode_structured("I think this is about billing.").is_err());
    }

    #[test]
    fn system_prompt_lists_categories() {
        let prompt = build_system_prompt();
        for c in Category::ALL {
            assert!(prompt.contains(c.as_str()));
        }
    }

    #[test]
    fn user_prompt_truncates_and_lists_attachments() {
        let msg = Message::new("a@b.com", "c@d.com", "Docs", "x".repeat(50))
            .with_attachment(Attachment::new("lease.pdf", 100, "application/pdf"));
        let prompt = build_user_prompt(&msg, 10);
        assert!(prompt.contains("lease.pdf (application/pdf, 100 bytes)"));
        assert!(prompt.contains("[truncated]"));
        assert!(!prompt.contains(&"x".repeat(11)));
    }
}
