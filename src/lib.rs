//! Intake gateway: routes inbound messages and runs follow-up workflows.

pub mod channels;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod telemetry;
