//! Classification & routing engine.
//!
//! `route` never fails. The AI path and the rules path each produce a
//! `DecisionSource`; `arbitrate` merges them into the final routing. Every
//! failure on the AI side ends in a rule-backed decision with
//! `is_fallback = true` and a trail entry naming the failure mode.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RoutingConfig;
use crate::error::{ClassificationError, PipelineError};
use crate::llm::provider::LlmProvider;
use crate::pipeline::classifier::{Classifier, RawClassification, decode_structured};
use crate::pipeline::extract::HeuristicExtractor;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{
    AiDecision, Category, ClassificationResult, DecisionSource, ExtractionMode, Message, Priority,
    RoutingDecision, RuleDecision,
};

/// Destination when nothing more specific applies.
pub const DEFAULT_DESTINATION: &str = "general-intake";

/// Last-resort destination on every fallback list.
pub const MANUAL_REVIEW: &str = "manual-review";

/// Static category → destination table.
pub fn destination_for(category: Category) -> &'static str {
    match category {
        Category::Emergency => "emergency-response",
        Category::Lawsuit => "litigation",
        Category::DocumentSubmission => "document-intake",
        Category::Inquiry => DEFAULT_DESTINATION,
        Category::Appointment => "scheduling",
        Category::Billing => "billing",
        Category::ClientCommunication => "client-services",
    }
}

/// Ordered fallback destinations for a decision, never containing `primary`.
fn fallback_chain(primary: &str, category: Category) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    for dest in [destination_for(category), DEFAULT_DESTINATION, MANUAL_REVIEW] {
        if dest != primary && !chain.iter().any(|d| d == dest) {
            chain.push(dest.to_string());
        }
    }
    chain
}

// ── Arbitration ─────────────────────────────────────────────────────

/// Output of `arbitrate`: everything the routing decision needs except
/// identity and timing.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub classification: ClassificationResult,
    pub primary_destination: String,
    pub source: DecisionSource,
    pub trail: Vec<String>,
}

/// Merge the AI outcome and the rule decision into one verdict.
///
/// - AI failed: the rule decision stands, `is_fallback`.
/// - AI below `threshold` and disagreeing with the rules: the rules pick
///   category and destination, the higher priority of the two is kept, and
///   both reasonings are recorded, `is_fallback`.
/// - Otherwise the AI decision stands. Heuristically recovered AI decisions
///   are still `is_fallback`. A CRITICAL rule priority always wins, and a
///   rule-forced destination (case routing) always applies.
pub fn arbitrate(
    ai: Result<AiDecision, ClassificationError>,
    rule: RuleDecision,
    threshold: f32,
) -> Verdict {
    let mut trail = Vec::new();

    let ai = match ai {
        Ok(ai) => ai,
        Err(e) => {
            trail.push(format!("fallback to rules after inference {}", e.mode()));
            trail.push(format!("rules: {}", rule.reasoning));
            return rule_verdict(rule, trail, None);
        }
    };

    let heuristic = ai.extraction == ExtractionMode::Heuristic;

    if ai.confidence < threshold {
        if ai.category != rule.category {
            trail.push(format!(
                "AI confidence {:.2} below threshold {:.2}; rules disagree (ai: {}, rules: {})",
                ai.confidence, threshold, ai.category, rule.category
            ));
            trail.push(format!("ai: {}", ai.reasoning));
            trail.push(format!("rules: {}", rule.reasoning));
            return rule_verdict(rule, trail, Some(ai.priority));
        }
        trail.push(format!(
            "AI confidence {:.2} below threshold {:.2}; rules agree on {}",
            ai.confidence, threshold, ai.category
        ));
    } else {
        trail.push(format!(
            "AI classified as {} / {} (confidence {:.2})",
            ai.category, ai.priority, ai.confidence
        ));
    }

    let mut priority = ai.priority;
    if rule.priority == Priority::Critical && priority < Priority::Critical {
        trail.push(format!(
            "rules flag CRITICAL ({}); raising priority from {}",
            rule.matched_rules.join(", "),
            priority
        ));
        priority = Priority::Critical;
    }

    let primary = match rule.destination {
        Some(ref dest) => {
            trail.push(format!("recipient case routing → {dest}"));
            dest.clone()
        }
        None => destination_for(ai.category).to_string(),
    };

    Verdict {
        classification: ClassificationResult {
            category: ai.category,
            priority,
            confidence: ai.confidence,
            reasoning: ai.reasoning.clone(),
            is_fallback: heuristic,
        },
        primary_destination: primary,
        source: DecisionSource::Ai(ai),
        trail,
    }
}

fn rule_verdict(rule: RuleDecision, trail: Vec<String>, ai_priority: Option<Priority>) -> Verdict {
    let priority = ai_priority.map_or(rule.priority, |p| p.max(rule.priority));
    let primary = rule
        .destination
        .clone()
        .unwrap_or_else(|| destination_for(rule.category).to_string());
    Verdict {
        classification: ClassificationResult {
            category: rule.category,
            priority,
            confidence: rule.confidence,
            reasoning: rule.reasoning.clone(),
            is_fallback: true,
        },
        primary_destination: primary,
        source: DecisionSource::Rule(rule),
        trail,
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Routes messages. Cheap to share behind an `Arc`.
pub struct RoutingEngine {
    classifier: Option<Classifier>,
    rules: RulesEngine,
    extractor: HeuristicExtractor,
    config: RoutingConfig,
}

impl RoutingEngine {
    /// Create an engine. Without a provider every decision comes from the rules.
    pub fn new(
        llm: Option<Arc<dyn LlmProvider>>,
        config: RoutingConfig,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            classifier: llm.map(|llm| {
                Classifier::new(llm, config.max_output_tokens, config.body_excerpt_chars)
            }),
            rules: RulesEngine::default_rules()?,
            extractor: HeuristicExtractor::new()?,
            config,
        })
    }

    /// Replace the rules engine.
    pub fn with_rules(mut self, rules: RulesEngine) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Produce a routing decision. Never fails; bounded by the routing budget.
    pub async fn route(&self, message: &Message) -> RoutingDecision {
        let started = Instant::now();
        let message_id = if message.id.trim().is_empty() {
            let id = Uuid::new_v4().to_string();
            debug!(id = %id, "Assigned message id");
            id
        } else {
            message.id.clone()
        };

        if let Some(reason) = message.corruption() {
            let err = ClassificationError::CorruptInput(reason.to_string());
            warn!(id = %message_id, error = %err, "Corrupt input, skipping classification");
            let rule = RulesEngine::corrupt_input(reason);
            let mut verdict = rule_verdict(rule, Vec::new(), None);
            verdict.trail.push(format!("{}: {reason}", err.mode()));
            verdict.primary_destination = DEFAULT_DESTINATION.to_string();
            return finish(message_id, verdict, Decimal::ZERO);
        }

        let rule = self.rules.evaluate(message);
        let mut trail = Vec::new();
        let mut cost = Decimal::ZERO;
        let ai = self.infer(message, started, &mut trail, &mut cost).await;

        if let Err(ref e) = ai {
            warn!(
                id = %message_id,
                mode = e.mode(),
                error = %e,
                "AI classification failed, using rules"
            );
        }

        let mut verdict = arbitrate(ai, rule, self.config.confidence_threshold);
        trail.append(&mut verdict.trail);
        verdict.trail = trail;

        let decision = finish(message_id, verdict, cost);
        info!(
            id = %decision.message_id,
            category = %decision.classification.category,
            priority = %decision.classification.priority,
            destination = %decision.primary_destination,
            source = decision.source.label(),
            is_fallback = decision.is_fallback,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Message routed"
        );
        decision
    }

    /// Run the AI path: at most one inline retry on unavailability, every
    /// call bounded by the per-call timeout and the remaining budget.
    async fn infer(
        &self,
        message: &Message,
        started: Instant,
        trail: &mut Vec<String>,
        cost: &mut Decimal,
    ) -> Result<AiDecision, ClassificationError> {
        let Some(ref classifier) = self.classifier else {
            trail.push("inference unavailable: no provider configured".into());
            return Err(ClassificationError::InferenceUnavailable(
                "no provider configured".into(),
            ));
        };

        let attempts = if self.config.retry_unavailable { 2 } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let remaining = self
                .config
                .routing_budget
                .saturating_sub(started.elapsed());
            if remaining.is_zero() {
                trail.push("inference timeout: routing budget exhausted".into());
                return Err(ClassificationError::InferenceTimeout(self.config.routing_budget));
            }
            let bound = remaining.min(self.config.inference_timeout);

            match tokio::time::timeout(bound, classifier.call(message)).await {
                Err(_) => {
                    trail.push(format!("inference timeout after {}ms", bound.as_millis()));
                    return Err(ClassificationError::InferenceTimeout(bound));
                }
                Ok(Err(e)) => {
                    trail.push(format!("attempt {attempt}: {e}"));
                    if attempt < attempts {
                        debug!(id = %message.id, attempt, "Retrying unavailable inference");
                        continue;
                    }
                    return Err(e);
                }
                Ok(Ok(raw)) => {
                    *cost += raw.cost;
                    return self.interpret(raw, trail);
                }
            }
        }
    }

    /// Strict decode first; heuristic extraction only if that fails.
    fn interpret(
        &self,
        raw: RawClassification,
        trail: &mut Vec<String>,
    ) -> Result<AiDecision, ClassificationError> {
        match decode_structured(&raw.text) {
            Ok(structured) => Ok(AiDecision {
                category: structured.category,
                priority: structured.priority,
                confidence: structured.confidence,
                reasoning: structured.reasoning,
                extraction: ExtractionMode::Structured,
                cost: raw.cost,
            }),
            Err(e) => {
                trail.push(e.to_string());
                match self.extractor.extract(&raw.text) {
                    Some(extracted) => {
                        trail.push(format!(
                            "malformed response recovered heuristically as {} ({})",
                            extracted.category,
                            extracted.notes.join("; ")
                        ));
                        Ok(AiDecision {
                            category: extracted.category,
                            priority: extracted.priority,
                            confidence: extracted.confidence,
                            reasoning: excerpt(&raw.text, 200),
                            extraction: ExtractionMode::Heuristic,
                            cost: raw.cost,
                        })
                    }
                    None => {
                        trail.push("heuristic extraction found nothing usable".into());
                        Err(e)
                    }
                }
            }
        }
    }
}

fn excerpt(text: &str, max: usize) -> String {
    text.trim().chars().take(max).collect()
}

fn finish(message_id: String, verdict: Verdict, cost: Decimal) -> RoutingDecision {
    let category = verdict.classification.category;
    RoutingDecision {
        message_id,
        fallback_destinations: fallback_chain(&verdict.primary_destination, category),
        confidence: verdict.classification.confidence,
        is_fallback: verdict.classification.is_fallback,
        classification: verdict.classification,
        primary_destination: verdict.primary_destination,
        reasoning_trail: verdict.trail,
        source: verdict.source,
        cost,
        decided_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::error::LlmError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse, FinishReason};

    enum Behavior {
        Reply(String),
        Fail,
        Hang,
        FailOnceThenReply(String),
    }

    struct StubLlm {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl StubLlm {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
        fn model_name(&self) -> &str {
            "stub"
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (dec!(0.000001), dec!(0.000002))
        }
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = |text: &str| {
                Ok(CompletionResponse {
                    content: text.to_string(),
                    input_tokens: 100,
                    output_tokens: 50,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                })
            };
            match &self.behavior {
                Behavior::Reply(text) => reply(text),
                Behavior::Fail => Err(LlmError::RequestFailed {
                    provider: "stub".into(),
                    reason: "connection refused".into(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    reply("{}")
                }
                Behavior::FailOnceThenReply(text) => {
                    if n == 0 {
                        Err(LlmError::RequestFailed {
                            provider: "stub".into(),
                            reason: "503".into(),
                        })
                    } else {
                        reply(text)
                    }
                }
            }
        }
    }

    fn engine(llm: Option<Arc<dyn LlmProvider>>) -> RoutingEngine {
        RoutingEngine::new(llm, RoutingConfig::default()).unwrap()
    }

    fn msg(subject: &str, body: &str) -> Message {
        Message::new("client@example.com", "intake@firm.com", subject, body)
    }

    fn ai(category: Category, priority: Priority, confidence: f32) -> AiDecision {
        AiDecision {
            category,
            priority,
            confidence,
            reasoning: "model says so".into(),
            extraction: ExtractionMode::Structured,
            cost: Decimal::ZERO,
        }
    }

    fn rules_for(m: &Message) -> RuleDecision {
        RulesEngine::default_rules().unwrap().evaluate(m)
    }

    // ── arbitrate ───────────────────────────────────────────────────

    #[test]
    fn arbitrate_confident_ai_wins() {
        let m = msg("Question about billing", "");
        let v = arbitrate(Ok(ai(Category::Inquiry, Priority::Normal, 0.9)), rules_for(&m), 0.7);
        assert_eq!(v.classification.category, Category::Inquiry);
        assert!(!v.classification.is_fallback);
        assert_eq!(v.primary_destination, "general-intake");
        assert!(matches!(v.source, DecisionSource::Ai(_)));
    }

    #[test]
    fn arbitrate_low_confidence_disagreement_downgrades() {
        let m = msg("Invoice overdue", "");
        let v = arbitrate(Ok(ai(Category::Inquiry, Priority::High, 0.5)), rules_for(&m), 0.7);
        assert!(v.classification.is_fallback);
        assert_eq!(v.classification.category, Category::Billing);
        assert_eq!(v.classification.priority, Priority::High);
        assert_eq!(v.primary_destination, "billing");
        assert!(v.trail.iter().any(|t| t.starts_with("ai: ")));
        assert!(v.trail.iter().any(|t| t.starts_with("rules: ")));
    }

    #[test]
    fn arbitrate_low_confidence_agreement_keeps_ai() {
        let m = msg("Invoice overdue", "");
        let v = arbitrate(Ok(ai(Category::Billing, Priority::Normal, 0.5)), rules_for(&m), 0.7);
        assert!(!v.classification.is_fallback);
        assert!(v.trail[0].contains("rules agree"));
    }

    #[test]
    fn arbitrate_threshold_is_configurable() {
        let m = msg("Invoice overdue", "");
        let v = arbitrate(Ok(ai(Category::Inquiry, Priority::Normal, 0.5)), rules_for(&m), 0.4);
        assert!(!v.classification.is_fallback);
        assert_eq!(v.classification.category, Category::Inquiry);
    }

    #[test]
    fn arbitrate_critical_rule_raises_priority() {
        let m = msg("Subpoena", "");
        let v = arbitrate(Ok(ai(Category::Lawsuit, Priority::Normal, 0.95)), rules_for(&m), 0.7);
        assert_eq!(v.classification.priority, Priority::Critical);
        assert_eq!(v.classification.category, Category::Lawsuit);
    }

    #[test]
    fn arbitrate_case_routing_applies_to_ai() {
        let m = Message::new("x@y.com", "doe-v-roe@firm.com", "Filing", "");
        let v = arbitrate(Ok(ai(Category::Lawsuit, Priority::High, 0.9)), rules_for(&m), 0.7);
        assert_eq!(v.primary_destination, "case-doe-v-roe");
    }

    #[test]
    fn arbitrate_error_uses_rules() {
        let m = msg("Subpoena", "");
        let v = arbitrate(
            Err(ClassificationError::InferenceTimeout(Duration::from_secs(3))),
            rules_for(&m),
            0.7,
        );
        assert!(v.classification.is_fallback);
        assert_eq!(v.primary_destination, "emergency-response");
        assert!(v.trail[0].contains("timeout"));
    }

    #[test]
    fn arbitrate_heuristic_is_fallback() {
        let m = msg("Invoice", "");
        let mut d = ai(Category::Billing, Priority::Normal, 0.9);
        d.extraction = ExtractionMode::Heuristic;
        let v = arbitrate(Ok(d), rules_for(&m), 0.7);
        assert!(v.classification.is_fallback);
        assert!(matches!(v.source, DecisionSource::Ai(_)));
    }

    #[test]
    fn fallback_chain_excludes_primary() {
        assert_eq!(
            fallback_chain("litigation", Category::Lawsuit),
            vec!["general-intake".to_string(), "manual-review".to_string()]
        );
        assert_eq!(
            fallback_chain("case-a-v-b", Category::Lawsuit),
            vec![
                "litigation".to_string(),
                "general-intake".to_string(),
                "manual-review".to_string()
            ]
        );
        assert_eq!(
            fallback_chain("general-intake", Category::Inquiry),
            vec!["manual-review".to_string()]
        );
    }

    // ── route ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn structured_reply_routes_by_ai() {
        let llm = StubLlm::new(Behavior::Reply(
            r#"{"category":"appointment","priority":"NORMAL","confidence":0.9,"reasoning":"wants a meeting"}"#.into(),
        ));
        let d = engine(Some(llm)).route(&msg("Can we meet?", "Next Tuesday?")).await;
        assert!(!d.is_fallback);
        assert_eq!(d.primary_destination, "scheduling");
        assert_eq!(d.cost, dec!(0.0002));
    }

    #[tokio::test]
    async fn unavailable_inference_falls_back_after_one_retry() {
        let llm = StubLlm::new(Behavior::Fail);
        let e = engine(Some(llm.clone()));
        let d = e.route(&msg("URGENT: Motion for Summary Judgment", "")).await;
        assert!(d.is_fallback);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
        assert!(d.classification.priority >= Priority::High);
        assert!(d.reasoning_trail.iter().any(|t| t.contains("unavailable")));
        assert!(!d.message_id.is_empty());
    }

    #[tokio::test]
    async fn retry_recovers() {
        let llm = StubLlm::new(Behavior::FailOnceThenReply(
            r#"{"category":"billing","priority":"LOW","confidence":0.8}"#.into(),
        ));
        let d = engine(Some(llm.clone())).route(&msg("Invoice", "")).await;
        assert!(!d.is_fallback);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
        assert!(d.reasoning_trail[0].starts_with("attempt 1:"));
    }

    #[tokio::test]
    async fn retry_disabled_calls_once() {
        let llm = StubLlm::new(Behavior::Fail);
        let config = RoutingConfig {
            retry_unavailable: false,
            ..RoutingConfig::default()
        };
        let e = RoutingEngine::new(Some(llm.clone() as Arc<dyn LlmProvider>), config).unwrap();
        let d = e.route(&msg("hello", "")).await;
        assert!(d.is_fallback);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_inference_times_out_within_budget() {
        let llm = StubLlm::new(Behavior::Hang);
        let e = engine(Some(llm));
        let started = Instant::now();
        let d = e.route(&msg("Emergency", "")).await;
        assert!(started.elapsed() <= e.config().routing_budget);
        assert!(d.is_fallback);
        assert!(d.reasoning_trail.iter().any(|t| t.contains("timeout")));
        assert_eq!(d.primary_destination, "emergency-response");
    }

    #[tokio::test]
    async fn prose_reply_recovered_heuristically() {
        let llm = StubLlm::new(Behavior::Reply(
            "This is clearly a billing matter, priority: low, 90% confident.".into(),
        ));
        let d = engine(Some(llm)).route(&msg("Invoice", "")).await;
        assert!(d.is_fallback);
        assert_eq!(d.classification.category, Category::Billing);
        assert!(d.reasoning_trail.iter().any(|t| t.contains("malformed")));
        assert!(matches!(
            d.source,
            DecisionSource::Ai(AiDecision {
                extraction: ExtractionMode::Heuristic,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn garbage_reply_falls_back_to_rules() {
        let llm = StubLlm::new(Behavior::Reply("¯\\_(ツ)_/¯".into()));
        let d = engine(Some(llm)).route(&msg("Subpoena", "")).await;
        assert!(d.is_fallback);
        assert!(matches!(d.source, DecisionSource::Rule(_)));
        assert!(d.reasoning_trail.iter().any(|t| t.contains("malformed")));
        assert_eq!(d.classification.priority, Priority::Critical);
    }

    #[tokio::test]
    async fn no_provider_is_rules_only() {
        let d = engine(None).route(&msg("Reschedule", "")).await;
        assert!(d.is_fallback);
        assert_eq!(d.primary_destination, "scheduling");
        assert_eq!(d.cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn corrupt_input_short_circuits() {
        let llm = StubLlm::new(Behavior::Reply("{}".into()));
        let d = engine(Some(llm.clone())).route(&Message::new("", "", "", "")).await;
        assert!(d.is_fallback);
        assert_eq!(d.primary_destination, DEFAULT_DESTINATION);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert!(d.reasoning_trail[0].starts_with("corrupt_input"));
    }

    #[tokio::test]
    async fn ids_are_kept_or_assigned() {
        let e = engine(None);
        let kept = e.route(&msg("hi", "").with_id("abc-1")).await;
        assert_eq!(kept.message_id, "abc-1");
        let assigned = e.route(&msg("hi", "").with_id("")).await;
        assert!(!assigned.message_id.is_empty());
    }
}
