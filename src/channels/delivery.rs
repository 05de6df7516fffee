//! Delivery adapters.
//!
//! Delivery is the last hop of the pipeline. Adapter errors are logged by the
//! caller and never undo a routing decision.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::DeliveryError;
use crate::pipeline::types::{Message, RoutingDecision};

/// An outbound reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySpec {
    /// Message being replied to.
    pub in_reply_to: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl ReplySpec {
    /// Receipt acknowledgment for a routed message.
    pub fn acknowledgment(message: &Message, decision: &RoutingDecision) -> Self {
        let subject = if message.subject.trim().is_empty() {
            "Your message was received".to_string()
        } else if message.subject.to_lowercase().starts_with("re:") {
            message.subject.clone()
        } else {
            format!("Re: {}", message.subject)
        };
        Self {
            in_reply_to: decision.message_id.clone(),
            recipient: message.sender.clone(),
            subject,
            body: format!(
                "We received your message and routed it to our {} team. Reference: {}.",
                decision.primary_destination, decision.message_id
            ),
        }
    }
}

/// Forwards routed messages and sends replies.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Hand a routing decision to its primary destination.
    async fn forward(&self, decision: &RoutingDecision) -> Result<(), DeliveryError>;

    /// Send a reply to the original sender.
    async fn reply(&self, reply: &ReplySpec) -> Result<(), DeliveryError>;
}

/// Logs deliveries instead of sending them.
pub struct LogDelivery;

#[async_trait]
impl DeliveryAdapter for LogDelivery {
    fn name(&self) -> &str {
        "log"
    }

    async fn forward(&self, decision: &RoutingDecision) -> Result<(), DeliveryError> {
        info!(
            id = %decision.message_id,
            destination = %decision.primary_destination,
            fallbacks = ?decision.fallback_destinations,
            "Forwarded"
        );
        Ok(())
    }

    async fn reply(&self, reply: &ReplySpec) -> Result<(), DeliveryError> {
        info!(
            in_reply_to = %reply.in_reply_to,
            recipient = %reply.recipient,
            subject = %reply.subject,
            "Reply sent"
        );
        Ok(())
    }
}

/// Records deliveries in memory. Can be told to fail.
#[derive(Default)]
pub struct MemoryDelivery {
    forwarded: Mutex<Vec<(String, String)>>,
    replies: Mutex<Vec<ReplySpec>>,
    fail: bool,
}

impl MemoryDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// (message id, destination) pairs forwarded so far.
    pub async fn forwarded(&self) -> Vec<(String, String)> {
        self.forwarded.lock().await.clone()
    }

    pub async fn replies(&self) -> Vec<ReplySpec> {
        self.replies.lock().await.clone()
    }
}

#[async_trait]
impl DeliveryAdapter for MemoryDelivery {
    fn name(&self) -> &str {
        "memory"
    }

    async fn forward(&self, decision: &RoutingDecision) -> Result<(), DeliveryError> {
        if self.fail {
            return Err(DeliveryError::ForwardFailed {
                destination: decision.primary_destination.clone(),
                reason: "adapter configured to fail".into(),
            });
        }
        self.forwarded.lock().await.push((
            decision.message_id.clone(),
            decision.primary_destination.clone(),
        ));
        Ok(())
    }

    async fn reply(&self, reply: &ReplySpec) -> Result<(), DeliveryError> {
        if self.fail {
            return Err(DeliveryError::ReplyFailed {
                recipient: reply.recipient.clone(),
                reason: "adapter configured to fail".into(),
            });
        }
        self.replies.lock().await.push(reply.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::pipeline::types::{
        Category, ClassificationResult, DecisionSource, Priority, RuleDecision,
    };

    fn decision(id: &str) -> RoutingDecision {
        let rule = RuleDecision {
            category: Category::Billing,
            priority: Priority::Normal,
            confidence: 0.65,
            destination: None,
            matched_rules: vec!["billing".into()],
            reasoning: "rules".into(),
        };
        RoutingDecision {
            message_id: id.into(),
            classification: ClassificationResult {
                category: rule.category,
                priority: rule.priority,
                confidence: rule.confidence,
                reasoning: rule.reasoning.clone(),
                is_fallback: true,
            },
            primary_destination: "billing".into(),
            fallback_destinations: vec!["general-intake".into()],
            confidence: 0.65,
            is_fallback: true,
            reasoning_trail: vec![],
            source: DecisionSource::Rule(rule),
            cost: Decimal::ZERO,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn acknowledgment_subject() {
        let m = Message::new("jane@example.com", "intake@firm.com", "Invoice", "");
        let ack = ReplySpec::acknowledgment(&m, &decision("m1"));
        assert_eq!(ack.subject, "Re: Invoice");
        assert_eq!(ack.recipient, "jane@example.com");
        assert!(ack.body.contains("billing"));

        let m = Message::new("jane@example.com", "intake@firm.com", "RE: Invoice", "");
        assert_eq!(ReplySpec::acknowledgment(&m, &decision("m1")).subject, "RE: Invoice");
    }

    #[tokio::test]
    async fn memory_delivery_records() {
        let d = MemoryDelivery::new();
        d.forward(&decision("m1")).await.unwrap();
        assert_eq!(d.forwarded().await, vec![("m1".into(), "billing".into())]);
    }

    #[tokio::test]
    async fn failing_delivery_errors() {
        let d = MemoryDelivery::failing();
        assert!(d.forward(&decision("m1")).await.is_err());
        assert!(d.forwarded().await.is_empty());
    }
}
