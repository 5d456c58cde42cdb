//! splitlinkd — Splitlink role daemon.
//!
//! One binary, three roles: `splitlinkd source | relay | controller`.
//! The role endpoints live in splitlink-services; this binary only wires
//! config, logging, and the inference-engine implementation together.

use std::sync::Arc;

use anyhow::{bail, Result};

use splitlink_core::config::SplitlinkConfig;
use splitlink_services::{controller, relay, source, InferenceEngine, MockEngine};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SplitlinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SplitlinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SplitlinkConfig::default()
    });

    let role = match std::env::args().nth(1) {
        Some(role) => role,
        None => bail!("usage: splitlinkd <source|relay|controller>"),
    };
    tracing::info!(role, "splitlinkd starting");

    // The engine seam. The mock engine stands in for the real model
    // runtime; swap the construction here to integrate one.
    let engine: Arc<dyn InferenceEngine> = Arc::new(MockEngine::default());

    match role.as_str() {
        "source" => source::run(config, engine).await,
        "relay" => relay::run(config, engine).await,
        "controller" => controller::run(config).await,
        other => bail!("unknown role {other:?} — expected source, relay, or controller"),
    }
}
