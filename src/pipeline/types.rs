//! Shared types for the intake pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Inbound message ─────────────────────────────────────────────────

/// Attachment descriptor. Contents live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size: u64,
    pub media_type: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, size: u64, media_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            media_type: media_type.into(),
        }
    }
}

/// Immutable inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Caller-supplied or generated id. An empty id gets one assigned at routing.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Create a message with a generated id.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Why this message can't be classified at all, if it can't.
    pub fn corruption(&self) -> Option<&'static str> {
        let blank = |s: &str| s.trim().is_empty();
        if blank(&self.sender)
            && blank(&self.subject)
            && blank(&self.body)
            && self.attachments.is_empty()
        {
            return Some("message has no sender, subject, body, or attachments");
        }
        if self.subject.contains('\0') || self.body.contains('\0') {
            return Some("message contains NUL bytes");
        }
        None
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Fixed set of intake categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Lawsuit,
    DocumentSubmission,
    Emergency,
    Inquiry,
    Appointment,
    Billing,
    ClientCommunication,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Lawsuit,
        Category::DocumentSubmission,
        Category::Emergency,
        Category::Inquiry,
        Category::Appointment,
        Category::Billing,
        Category::ClientCommunication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lawsuit => "lawsuit",
            Self::DocumentSubmission => "document_submission",
            Self::Emergency => "emergency",
            Self::Inquiry => "inquiry",
            Self::Appointment => "appointment",
            Self::Billing => "billing",
            Self::ClientCommunication => "client_communication",
        }
    }

    /// Lenient parse: case-insensitive, accepts spaces or dashes for underscores.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|c| c.as_str() == normalized)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority, ordered `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" | "medium" => Some(Self::Normal),
            "high" | "urgent" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification attached to a message's processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub priority: Priority,
    /// In [0, 1].
    pub confidence: f32,
    pub reasoning: String,
    pub is_fallback: bool,
}

// ── Decision sources ────────────────────────────────────────────────

/// How an AI decision was recovered from the model's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Strict structured decode succeeded.
    Structured,
    /// Structured decode failed; fields were recovered heuristically.
    Heuristic,
}

/// Decision produced by the inference path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDecision {
    pub category: Category,
    pub priority: Priority,
    pub confidence: f32,
    pub reasoning: String,
    pub extraction: ExtractionMode,
    /// Inference cost of producing this decision.
    #[serde(default)]
    pub cost: Decimal,
}

/// Decision produced by the deterministic rules engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDecision {
    pub category: Category,
    pub priority: Priority,
    pub confidence: f32,
    /// Destination forced by a rule (e.g. case routing), overriding the table.
    pub destination: Option<String>,
    /// Names of the rules that matched.
    pub matched_rules: Vec<String>,
    pub reasoning: String,
}

impl RuleDecision {
    /// Whether any keyword rule matched (as opposed to the default).
    pub fn has_signal(&self) -> bool {
        !self.matched_rules.is_empty()
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DecisionSource {
    Ai(AiDecision),
    Rule(RuleDecision),
}

impl DecisionSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ai(_) => "ai",
            Self::Rule(_) => "rule",
        }
    }
}

// ── Routing decision ────────────────────────────────────────────────

/// Where to deliver a message, and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Correlation key; always present, even when classification failed.
    pub message_id: String,
    pub classification: ClassificationResult,
    pub primary_destination: String,
    pub fallback_destinations: Vec<String>,
    pub confidence: f32,
    pub is_fallback: bool,
    /// Ordered explanation of every decision step, including forced fallbacks.
    pub reasoning_trail: Vec<String>,
    /// Which source the final routing follows.
    pub source: DecisionSource,
    /// Inference spend for this decision.
    #[serde(default)]
    pub cost: Decimal,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_is_lenient() {
        assert_eq!(
            Category::parse("Document Submission"),
            Some(Category::DocumentSubmission)
        );
        assert_eq!(
            Category::parse("client-communication"),
            Some(Category::ClientCommunication)
        );
        assert_eq!(Category::parse(" LAWSUIT "), Some(Category::Lawsuit));
        assert_eq!(Category::parse("spam"), None);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::parse("Urgent"), Some(Priority::High));
    }

    #[test]
    fn priority_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&Priority::Critical).unwrap(),
            "\"CRITICAL\""
        );
        assert_eq!(
            serde_json::to_string(&Category::DocumentSubmission).unwrap(),
            "\"document_submission\""
        );
    }

    #[test]
    fn message_defaults_from_sparse_json() {
        let msg: Message = serde_json::from_str(r#"{"subject": "hello"}"#).unwrap();
        assert!(msg.id.is_empty());
        assert!(msg.attachments.is_empty());
        assert!(msg.corruption().is_none());
    }

    #[test]
    fn empty_message_is_corrupt() {
        let msg = Message::new("", "", "  ", "");
        assert!(msg.corruption().is_some());
        let with_attachment = msg.with_attachment(Attachment::new("a.pdf", 10, "application/pdf"));
        assert!(with_attachment.corruption().is_none());
    }

    #[test]
    fn nul_bytes_are_corrupt() {
        let msg = Message::new("a@b.com", "c@d.com", "hi", "bad\0body");
        assert!(msg.corruption().is_some());
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = Message::new("a", "b", "c", "d");
        let b = Message::new("a", "b", "c", "d");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn decision_source_is_tagged() {
        let source = DecisionSource::Rule(RuleDecision {
            category: Category::Inquiry,
            priority: Priority::Normal,
            confidence: 0.4,
            destination: None,
            matched_rules: vec![],
            reasoning: "default".into(),
        });
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["source"], "rule");
        assert_eq!(json["category"], "inquiry");
        assert_eq!(source.label(), "rule");
    }
}
