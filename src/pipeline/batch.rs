//! Batch consumer.
//!
//! Items are handled one at a time, highest priority first. Each item is
//! acked on success or retried with backoff up to `max_attempts`. Aggregate
//! metrics are persisted after every batch, whatever happened to the items.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::BatchConfig;
use crate::error::{PipelineError, StorageError};
use crate::pipeline::processor::IntakePipeline;
use crate::pipeline::types::{Message, Priority};
use crate::store::traits::{BATCH_METRICS_KEY, MESSAGE_PREFIX, StateStore, get_json, put_json};
use crate::telemetry::{TelemetryEvent, TelemetryHandle};

/// Upper bound on a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub entity_id: String,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Auxiliary ordering score; higher goes first within a priority.
    #[serde(default)]
    pub score: f64,
}

impl BatchItem {
    pub fn new(entity_id: impl Into<String>, priority: Priority) -> Self {
        Self {
            entity_id: entity_id.into(),
            priority,
            timestamp: Utc::now(),
            score: 0.0,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

/// Handles one item. `Ok` carries the cost the item accrued.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, item: &BatchItem) -> Result<Decimal, PipelineError>;
}

/// What happened to one item.
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub entity_id: String,
    pub acked: bool,
    pub attempts: u32,
    pub cost: Decimal,
    pub error: Option<String>,
}

/// What happened to one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// In processing order.
    pub items: Vec<ItemReport>,
    pub acked: usize,
    pub failed: usize,
    pub retries: u64,
    pub cost: Decimal,
}

/// Running totals across batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub batches: u64,
    pub items: u64,
    pub acked: u64,
    pub failed: u64,
    pub retries: u64,
    pub total_cost: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BatchMetrics {
    fn accrue(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.items += report.items.len() as u64;
        self.acked += report.acked as u64;
        self.failed += report.failed as u64;
        self.retries += report.retries;
        self.total_cost += report.cost;
        self.updated_at = Some(Utc::now());
    }
}

/// Load the persisted metrics (zeroed if none yet).
pub async fn load_metrics(store: &dyn StateStore) -> Result<BatchMetrics, StorageError> {
    Ok(get_json(store, BATCH_METRICS_KEY).await?.unwrap_or_default())
}

/// Highest priority first, then highest score, then oldest.
pub fn order_items(items: &mut [BatchItem]) {
    items.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.score.total_cmp(&a.score))
            .then(a.timestamp.cmp(&b.timestamp))
    });
}

/// Exponential delay for the given attempt (1-based) plus up to 10% jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let ceiling = (exp.as_millis() / 10) as u64;
    let jitter = if ceiling == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=ceiling)
    };
    exp.saturating_add(Duration::from_millis(jitter)).min(MAX_BACKOFF)
}

pub struct BatchConsumer {
    handler: Arc<dyn BatchHandler>,
    store: Arc<dyn StateStore>,
    config: BatchConfig,
    telemetry: TelemetryHandle,
}

impl BatchConsumer {
    pub fn new(
        handler: Arc<dyn BatchHandler>,
        store: Arc<dyn StateStore>,
        config: BatchConfig,
        telemetry: TelemetryHandle,
    ) -> Self {
        Self {
            handler,
            store,
            config,
            telemetry,
        }
    }

    /// Handle every item and update the aggregate metrics.
    pub async fn consume(&self, mut items: Vec<BatchItem>) -> BatchReport {
        order_items(&mut items);
        let max_attempts = self.config.max_attempts.max(1);
        let mut report = BatchReport::default();

        info!(count = items.len(), "Consuming batch");

        for item in &items {
            let mut attempts = 0;
            let result = loop {
                attempts += 1;
                match self.handler.handle(item).await {
                    Ok(cost) => break Ok(cost),
                    Err(e) if attempts < max_attempts => {
                        let delay = backoff_delay(self.config.retry_backoff, attempts);
                        warn!(
                            entity_id = %item.entity_id,
                            attempt = attempts,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Batch item failed, retrying"
                        );
                        report.retries += 1;
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            let item_report = match result {
                Ok(cost) => {
                    report.acked += 1;
                    report.cost += cost;
                    ItemReport {
                        entity_id: item.entity_id.clone(),
                        acked: true,
                        attempts,
                        cost,
                        error: None,
                    }
                }
                Err(e) => {
                    error!(entity_id = %item.entity_id, attempts, error = %e, "Batch item failed");
                    report.failed += 1;
                    ItemReport {
                        entity_id: item.entity_id.clone(),
                        acked: false,
                        attempts,
                        cost: Decimal::ZERO,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.items.push(item_report);
        }

        if let Err(e) = self.persist_metrics(&report).await {
            error!(error = %e, "Failed to persist batch metrics");
        }
        self.telemetry.emit(TelemetryEvent::BatchProcessed {
            items: report.items.len(),
            acked: report.acked,
            failed: report.failed,
            cost: report.cost,
        });

        info!(
            acked = report.acked,
            failed = report.failed,
            retries = report.retries,
            cost = %report.cost,
            "Batch complete"
        );
        report
    }

    async fn persist_metrics(&self, report: &BatchReport) -> Result<(), StorageError> {
        let mut metrics = load_metrics(self.store.as_ref()).await?;
        metrics.accrue(report);
        put_json(self.store.as_ref(), BATCH_METRICS_KEY, &metrics, None).await
    }
}

/// Runs parked messages (`message:<id>`) through the intake pipeline.
pub struct IntakeBatchHandler {
    pipeline: Arc<IntakePipeline>,
    store: Arc<dyn StateStore>,
}

impl IntakeBatchHandler {
    pub fn new(pipeline: Arc<IntakePipeline>, store: Arc<dyn StateStore>) -> Self {
        Self { pipeline, store }
    }
}

#[async_trait]
impl BatchHandler for IntakeBatchHandler {
    async fn handle(&self, item: &BatchItem) -> Result<Decimal, PipelineError> {
        let key = format!("{MESSAGE_PREFIX}{}", item.entity_id);
        let message: Message = get_json(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| PipelineError::MessageNotFound(item.entity_id.clone()))?;

        let outcome = self.pipeline.process(message).await;
        if outcome.duplicate || outcome.forwarded {
            Ok(outcome.decision.cost)
        } else {
            Err(PipelineError::ItemFailed {
                id: item.entity_id.clone(),
                reason: outcome.issues.join("; "),
            })
        }
    }
}
