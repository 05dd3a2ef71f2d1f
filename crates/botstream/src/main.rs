//! Runs the configured subscriptions and logs every change it receives.
//!
//! Usage: `botstream [config.toml]`

use anyhow::Context;
use botstream::{
    BotClient, BotStreamConfig, EventType, ObservabilitySystem, Operation, PipelineError,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => BotStreamConfig::load_from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => BotStreamConfig::load().context("failed to load configuration")?,
    };

    ObservabilitySystem::init(&config.observability)?;

    let tables: Vec<String> = config
        .upstream
        .subscriptions
        .iter()
        .map(|s| s.table.clone())
        .collect();

    let mut client = BotClient::new(config)?;
    for table in &tables {
        for operation in [Operation::Insert, Operation::Update, Operation::Delete] {
            let event_type = EventType::new(table, operation);
            let label = event_type.to_string();
            client.on(event_type, move |row| {
                let label = label.clone();
                async move {
                    info!(event_type = %label, row = %row, "Change received");
                    Ok::<_, anyhow::Error>(())
                }
            })?;
        }
    }

    client.start().await?;
    info!(bot_id = client.auth_context().bot_id(), "botstream running, press Ctrl-C to stop");

    let shutdown = client.cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        _ = shutdown.cancelled() => {}
    }

    // An external cancellation already drove the client to `Stopped`.
    match client.stop().await {
        Ok(()) | Err(PipelineError::NotRunning) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
