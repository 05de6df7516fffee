//! Intake pipeline.
//!
//! Every inbound message flows through:
//! 1. `ingest::parse_rfc822()` — raw mail only
//! 2. `RoutingEngine::route()` — AI classification, rules as fallback
//! 3. `IntakePipeline::process()` — workflows, sessions and delivery
//!
//! Routing always yields a decision. Failures along the way are absorbed
//! into the decision's reasoning trail or the outcome's issue list.

pub mod batch;
pub mod classifier;
pub mod engine;
pub mod extract;
pub mod ingest;
pub mod processor;
pub mod rules;
pub mod types;

pub use batch::{BatchConsumer, BatchItem, BatchMetrics, BatchReport, IntakeBatchHandler};
pub use engine::{RoutingEngine, arbitrate};
pub use processor::{IntakeOutcome, IntakePipeline, plan_workflow};
pub use types::{Category, Message, Priority, RoutingDecision};
