//! Telemetry pipeline.
//!
//! Producers hold a cloneable `TelemetryHandle` and never block: events go
//! into a bounded channel and are dropped when it is full. One background
//! task owns the buffer and flushes it to a `TelemetrySink` when it reaches
//! the batch size or when the flush interval elapses.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::config::TelemetryConfig;

/// Something worth counting.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    MessageRouted {
        message_id: String,
        category: String,
        priority: String,
        destination: String,
        source: String,
        is_fallback: bool,
        cost: Decimal,
    },
    DuplicateSkipped {
        message_id: String,
    },
    WorkflowFinished {
        task_id: String,
        task_type: String,
        state: String,
        completed: usize,
        total: usize,
        success_rate: f64,
    },
    DeliveryFailed {
        message_id: String,
        reason: String,
    },
    SessionConflict {
        session_id: String,
        conflicts: usize,
    },
    BatchProcessed {
        items: usize,
        acked: usize,
        failed: usize,
        cost: Decimal,
    },
}

/// Destination for flushed events.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn flush(&self, events: Vec<TelemetryEvent>);
}

/// Writes each event as a structured `tracing` record.
pub struct TracingSink;

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn flush(&self, events: Vec<TelemetryEvent>) {
        for event in &events {
            match serde_json::to_string(event) {
                Ok(json) => tracing::info!(target: "telemetry", "{json}"),
                Err(e) => tracing::warn!(target: "telemetry", error = %e, "Unserializable event"),
            }
        }
    }
}

/// Keeps flushed events in memory.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<TelemetryEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<TelemetryEvent> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }

    /// Size of each flush, in order.
    pub async fn flush_sizes(&self) -> Vec<usize> {
        self.batches.lock().await.iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn flush(&self, events: Vec<TelemetryEvent>) {
        self.batches.lock().await.push(events);
    }
}

/// Producer side of the telemetry channel.
#[derive(Clone)]
pub struct TelemetryHandle {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryHandle {
    /// A handle whose events go nowhere.
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an event without waiting.
    pub fn emit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Telemetry channel full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the flusher. It exits after a final flush once every handle is dropped.
pub fn spawn_flusher(
    config: &TelemetryConfig,
    sink: Arc<dyn TelemetrySink>,
) -> (TelemetryHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(config.channel_capacity.max(1));
    let batch_size = config.flush_batch_size.max(1);
    let interval = config.flush_interval;

    let task = tokio::spawn(async move {
        let mut buffer: Vec<TelemetryEvent> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            sink.flush(std::mem::take(&mut buffer)).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            sink.flush(std::mem::take(&mut buffer)).await;
                        }
                        debug!("Telemetry flusher stopped");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        sink.flush(std::mem::take(&mut buffer)).await;
                    }
                }
            }
        }
    });

    (
        TelemetryHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        task,
    )
}
