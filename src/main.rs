use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};

use intake_gateway::channels::LogDelivery;
use intake_gateway::config::GatewayConfig;
use intake_gateway::identity::LocalMinter;
use intake_gateway::llm::{LlmConfig, create_provider};
use intake_gateway::pipeline::{IntakeOutcome, IntakePipeline, Message};
use intake_gateway::store::{MemoryStore, StateStore};
use intake_gateway::telemetry::{TracingSink, spawn_flusher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries one JSON outcome per line.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;

    let llm = match LlmConfig::from_env() {
        Ok(llm_config) => Some(create_provider(&llm_config)),
        Err(e) => {
            warn!(error = %e, "No inference provider configured, routing with rules only");
            None
        }
    };

    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let (telemetry, flusher) = spawn_flusher(&config.telemetry, Arc::new(TracingSink));
    let pipeline = IntakePipeline::new(
        &config,
        llm,
        store,
        Arc::new(LogDelivery),
        Arc::new(LocalMinter::new(&config.node_id)),
        telemetry,
    )?;

    info!(node = %config.node_id, "Intake gateway v{}", env!("CARGO_PKG_VERSION"));

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => print_outcome(&pipeline.process(message).await)?,
                Err(e) => warn!(line = line_no, error = %e, "Skipping unparseable message"),
            }
        }
    } else {
        for path in &paths {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {path}"))?;
            let outcome = if is_raw_mail(path) {
                pipeline.process_raw(&bytes).await
            } else {
                let message: Message = serde_json::from_slice(&bytes)
                    .with_context(|| format!("{path} is not a JSON message"))?;
                pipeline.process(message).await
            };
            print_outcome(&outcome)?;
        }
    }

    // Dropping the pipeline closes the telemetry channel; wait for the last flush.
    drop(pipeline);
    flusher.await?;
    Ok(())
}

fn is_raw_mail(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("eml"))
}

fn print_outcome(outcome: &IntakeOutcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(outcome)?);
    Ok(())
}
