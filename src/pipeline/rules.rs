//! Deterministic rules engine.
//!
//! The fallback path for every classification failure. It has no external
//! dependencies and always produces a decision:
//! - emergency / TRO / subpoena language → `emergency`, CRITICAL
//! - litigation language → `lawsuit`, HIGH
//! - attachments or enclosure language → `document_submission`
//! - scheduling, billing, and client-matter language → their categories
//! - "urgent" / "ASAP" escalate one priority level
//! - bulk-mail markers demote to LOW
//! - a two-party case pattern in the recipient address → case routing
//!
//! Anything else lands on `inquiry` with a low confidence.

use regex::Regex;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::types::{Category, Message, Priority, RuleDecision};

/// Confidence reported when no rule matched.
pub const DEFAULT_RULE_CONFIDENCE: f32 = 0.3;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Recipient,
    Subject,
    Body,
    /// Subject and body.
    Text,
}

/// A category rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    /// Name recorded in `matched_rules`.
    pub name: String,
    pub regex: Regex,
    pub field: RuleField,
    pub category: Category,
    pub priority: Priority,
    pub confidence: f32,
}

/// Adjusts priority without choosing a category.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub name: String,
    pub regex: Regex,
    pub field: RuleField,
    pub adjustment: PriorityAdjustment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityAdjustment {
    /// One level up, capped at CRITICAL.
    Escalate,
    /// Down to LOW unless a rule already set HIGH or above.
    Demote,
}

/// Rules engine for classification fallback and AI cross-checks.
pub struct RulesEngine {
    /// Evaluated in order; the first match picks the category.
    category_rules: Vec<CategoryRule>,
    priority_rules: Vec<PriorityRule>,
    /// Two-party case pattern in the recipient local part.
    case_pattern: Option<Regex>,
}

fn rule(
    name: &str,
    pattern: &str,
    field: RuleField,
    category: Category,
    priority: Priority,
    confidence: f32,
) -> Result<CategoryRule, regex::Error> {
    Ok(CategoryRule {
        name: name.into(),
        regex: Regex::new(pattern)?,
        field,
        category,
        priority,
        confidence,
    })
}

impl RulesEngine {
    /// Create a rules engine with the default intake rules.
    pub fn default_rules() -> Result<Self, PipelineError> {
        let category_rules = vec![
            rule(
                "emergency",
                r"(?i)\b(emergency|emergencies|TRO|temporary restraining order|restraining order|subpoena|injunction|ex parte)\b",
                RuleField::Text,
                Category::Emergency,
                Priority::Critical,
                0.85,
            )?,
            rule(
                "lawsuit",
                r"(?i)\b(lawsuit|litigation|motion (for|to)|summary judgment|summons|complaint filed|served with|court order|hearing date|plaintiff|defendant)\b",
                RuleField::Text,
                Category::Lawsuit,
                Priority::High,
                0.8,
            )?,
            rule(
                "document_submission",
                r"(?i)\b(attached|attachment|enclosed|please find|documents?|signed (copy|contract|agreement))\b",
                RuleField::Text,
                Category::DocumentSubmission,
                Priority::Normal,
                0.65,
            )?,
            rule(
                "appointment",
                r"(?i)\b(appointment|schedule|reschedule|meeting|consultation|availability|calendar)\b",
                RuleField::Text,
                Category::Appointment,
                Priority::Normal,
                0.65,
            )?,
            rule(
                "billing",
                r"(?i)\b(invoice|billing|payment|retainer|balance due|statement of account|refund)\b",
                RuleField::Text,
                Category::Billing,
                Priority::Normal,
                0.65,
            )?,
            rule(
                "client_communication",
                r"(?i)\b(my case|our case|case update|status of (my|our)|following up|follow up|as discussed)\b",
                RuleField::Text,
                Category::ClientCommunication,
                Priority::Normal,
                0.6,
            )?,
        ];

        let priority_rules = vec![
            PriorityRule {
                name: "urgent".into(),
                regex: Regex::new(r"(?i)\b(urgent|asap|immediately|time[- ]sensitive|deadline)\b")?,
                field: RuleField::Text,
                adjustment: PriorityAdjustment::Escalate,
            },
            PriorityRule {
                name: "bulk_mail".into(),
                regex: Regex::new(r"(?i)(\bunsubscribe\b|\bnewsletter\b|manage your subscription|email preferences)")?,
                field: RuleField::Text,
                adjustment: PriorityAdjustment::Demote,
            },
            PriorityRule {
                name: "automated_sender".into(),
                regex: Regex::new(r"(?i)^(no[\-_.]?reply|mailer[\-_]?daemon|postmaster)@")?,
                field: RuleField::Sender,
                adjustment: PriorityAdjustment::Demote,
            },
        ];

        Ok(Self {
            category_rules,
            priority_rules,
            case_pattern: Some(Regex::new(
                r"(?i)^([a-z0-9]+)[\-_.]vs?[\-_.]([a-z0-9]+)@",
            )?),
        })
    }

    /// Create an empty rules engine (for testing).
    pub fn empty() -> Self {
        Self {
            category_rules: Vec::new(),
            priority_rules: Vec::new(),
            case_pattern: None,
        }
    }

    /// Append a category rule. Earlier rules take precedence.
    pub fn add_rule(
        &mut self,
        name: &str,
        pattern: &str,
        field: RuleField,
        category: Category,
        priority: Priority,
    ) -> Result<(), regex::Error> {
        self.category_rules
            .push(rule(name, pattern, field, category, priority, 0.7)?);
        Ok(())
    }

    /// Decision for input that can't be classified.
    pub fn corrupt_input(reason: &str) -> RuleDecision {
        RuleDecision {
            category: Category::Inquiry,
            priority: Priority::Normal,
            confidence: 0.0,
            destination: None,
            matched_rules: Vec::new(),
            reasoning: format!("corrupted input: {reason}"),
        }
    }

    /// Evaluate a message. Always produces a decision.
    pub fn evaluate(&self, message: &Message) -> RuleDecision {
        if let Some(reason) = message.corruption() {
            return Self::corrupt_input(reason);
        }

        let mut matched: Vec<String> = Vec::new();
        let mut picked: Option<&CategoryRule> = None;
        let mut priority = Priority::Normal;

        for rule in &self.category_rules {
            if field_matches(&rule.regex, rule.field, message) {
                matched.push(rule.name.clone());
                priority = priority.max(rule.priority);
                if picked.is_none() {
                    picked = Some(rule);
                }
            }
        }

        let (mut category, mut confidence) = match picked {
            Some(rule) => (rule.category, rule.confidence),
            None => (Category::Inquiry, DEFAULT_RULE_CONFIDENCE),
        };

        // Attachments alone are a submission signal.
        if picked.is_none() && !message.attachments.is_empty() {
            category = Category::DocumentSubmission;
            confidence = 0.6;
            matched.push("has_attachments".into());
        }

        let destination = self.case_destination(&message.recipient);
        if let Some(ref dest) = destination {
            matched.push("case_recipient".into());
            if picked.is_none() {
                category = Category::Lawsuit;
                confidence = confidence.max(0.6);
            }
            debug!(recipient = %message.recipient, destination = %dest, "Recipient matched case pattern");
        }

        let base_priority = priority;
        for rule in &self.priority_rules {
            if !field_matches(&rule.regex, rule.field, message) {
                continue;
            }
            matched.push(rule.name.clone());
            priority = match rule.adjustment {
                PriorityAdjustment::Escalate => escalate(priority),
                PriorityAdjustment::Demote if base_priority < Priority::High => Priority::Low,
                PriorityAdjustment::Demote => priority,
            };
        }

        let reasoning = if matched.is_empty() {
            "no rule matched; default intake".to_string()
        } else {
            format!(
                "rules matched [{}] → {} / {}",
                matched.join(", "),
                category,
                priority
            )
        };

        debug!(
            id = %message.id,
            category = %category,
            priority = %priority,
            rules = matched.len(),
            "Rules engine evaluated message"
        );

        RuleDecision {
            category,
            priority,
            confidence,
            destination,
            matched_rules: matched,
            reasoning,
        }
    }

    fn case_destination(&self, recipient: &str) -> Option<String> {
        let caps = self.case_pattern.as_ref()?.captures(recipient.trim())?;
        let left = caps.get(1)?.as_str().to_lowercase();
        let right = caps.get(2)?.as_str().to_lowercase();
        Some(format!("case-{left}-v-{right}"))
    }
}

fn field_matches(regex: &Regex, field: RuleField, message: &Message) -> bool {
    match field {
        RuleField::Sender => regex.is_match(&message.sender),
        RuleField::Recipient => regex.is_match(&message.recipient),
        RuleField::Subject => regex.is_match(&message.subject),
        RuleField::Body => regex.is_match(&message.body),
        RuleField::Text => regex.is_match(&message.subject) || regex.is_match(&message.body),
    }
}

fn escalate(priority: Priority) -> Priority {
    match priority {
        Priority::Low => Priority::Normal,
        Priority::Normal => Priority::High,
        Priority::High | Priority::Critical => Priority::Critical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Attachment;

    fn engine() -> RulesEngine {
        RulesEngine::default_rules().unwrap()
    }

    fn msg(subject: &str, body: &str) -> Message {
        Message::new("client@example.com", "intake@firm.com", subject, body)
    }

    #[test]
    fn emergency_keywords_are_critical() {
        for subject in ["Emergency hearing", "TRO filed today", "Subpoena received"] {
            let d = engine().evaluate(&msg(subject, ""));
            assert_eq!(d.category, Category::Emergency, "{subject}");
            assert_eq!(d.priority, Priority::Critical, "{subject}");
            assert!(d.has_signal());
        }
    }

    #[test]
    fn urgent_motion_escalates_lawsuit() {
        let d = engine().evaluate(&msg("URGENT: Motion for Summary Judgment", "Filed this morning."));
        assert_eq!(d.category, Category::Lawsuit);
        assert_eq!(d.priority, Priority::Critical);
        assert!(d.matched_rules.contains(&"urgent".to_string()));
    }

    #[test]
    fn lawsuit_without_urgency_is_high() {
        let d = engine().evaluate(&msg("Summons", "We were served with a summons."));
        assert_eq!(d.category, Category::Lawsuit);
        assert_eq!(d.priority, Priority::High);
    }

    #[test]
    fn attachments_mean_document_submission() {
        let m = msg("Hello", "Here you go").with_attachment(Attachment::new(
            "lease.pdf",
            2048,
            "application/pdf",
        ));
        let d = engine().evaluate(&m);
        assert_eq!(d.category, Category::DocumentSubmission);
        assert!(d.matched_rules.contains(&"has_attachments".to_string()));
    }

    #[test]
    fn case_recipient_routes_to_case() {
        let m = Message::new("opposing@law.com", "Smith-v-Jones@firm.com", "Re: filing", "See below");
        let d = engine().evaluate(&m);
        assert_eq!(d.destination.as_deref(), Some("case-smith-v-jones"));
        assert_eq!(d.category, Category::Lawsuit);

        let m = Message::new("a@b.com", "acme.vs.globex@firm.com", "hi", "");
        let d = engine().evaluate(&m);
        assert_eq!(d.destination.as_deref(), Some("case-acme-v-globex"));
    }

    #[test]
    fn newsletter_demoted() {
        let d = engine().evaluate(&msg("Weekly newsletter", "click to unsubscribe"));
        assert_eq!(d.priority, Priority::Low);
    }

    #[test]
    fn demotion_does_not_override_high() {
        let d = engine().evaluate(&msg("Subpoena", "unsubscribe"));
        assert_eq!(d.priority, Priority::Critical);
    }

    #[test]
    fn default_is_inquiry() {
        let d = engine().evaluate(&msg("Question", "What are your office hours?"));
        assert_eq!(d.category, Category::Inquiry);
        assert_eq!(d.priority, Priority::Normal);
        assert_eq!(d.confidence, DEFAULT_RULE_CONFIDENCE);
        assert!(!d.has_signal());
        assert!(d.destination.is_none());
    }

    #[test]
    fn billing_and_appointment() {
        assert_eq!(
            engine().evaluate(&msg("Invoice #42", "")).category,
            Category::Billing
        );
        assert_eq!(
            engine().evaluate(&msg("Reschedule our consultation", "")).category,
            Category::Appointment
        );
    }

    #[test]
    fn corrupt_message_has_defined_result() {
        let d = engine().evaluate(&Message::new("", "", "", ""));
        assert_eq!(d.category, Category::Inquiry);
        assert_eq!(d.confidence, 0.0);
        assert!(d.reasoning.starts_with("corrupted input"));
    }

    #[test]
    fn empty_engine_defaults() {
        let d = RulesEngine::empty().evaluate(&msg("Subpoena", "emergency"));
        assert_eq!(d.category, Category::Inquiry);
        assert!(d.matched_rules.is_empty());
    }

    #[test]
    fn custom_rule_appends() {
        let mut e = RulesEngine::empty();
        e.add_rule(
            "immigration",
            r"(?i)\bvisa\b",
            RuleField::Subject,
            Category::ClientCommunication,
            Priority::High,
        )
        .unwrap();
        let d = e.evaluate(&msg("Visa question", ""));
        assert_eq!(d.category, Category::ClientCommunication);
        assert_eq!(d.priority, Priority::High);
        assert_eq!(d.matched_rules, vec!["immigration".to_string()]);
    }

    #[test]
    fn invalid_custom_pattern_rejected() {
        let mut e = RulesEngine::empty();
        assert!(
            e.add_rule("bad", "(unclosed", RuleField::Body, Category::Billing, Priority::Low)
                .is_err()
        );
    }
}
