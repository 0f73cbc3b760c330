//! worker-bridge - issue one call against a supervised worker.
//!
//! Usage: `worker-bridge [--config PATH] <method> [params-json]`
//!
//! Starts the configured worker, waits for its port announcement, sends a
//! single JSON-RPC request, prints the result as JSON on stdout and shuts
//! the worker down again.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worker_bridge::{Bridge, BridgeConfig};

/// Issue one JSON-RPC call against a supervised worker
#[derive(Parser, Debug)]
#[command(name = "worker-bridge", version)]
struct Cli {
    /// Config file (defaults to $WORKER_BRIDGE_CONFIG, then the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Method to call
    method: String,

    /// Request params as JSON
    #[arg(value_parser = parse_params)]
    params: Option<Value>,
}

fn parse_params(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("params must be valid JSON: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging (stderr, so stdout carries only the result)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "worker_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::resolve().context("Failed to resolve configuration")?,
    };

    tracing::info!("Starting worker-bridge v{}", env!("CARGO_PKG_VERSION"));
    let bridge = Bridge::new(config);
    bridge.start().await.context("Failed to start worker")?;

    let params = cli.params.unwrap_or_else(|| Value::Object(Default::default()));
    let result = bridge
        .call(&cli.method, params)
        .await
        .with_context(|| format!("Call to '{}' failed", cli.method));
    bridge.stop().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
