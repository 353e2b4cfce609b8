//! Adventure Orchestration Core — CLI entry point.

use adventure_core::bus::EventBus;
use adventure_core::orchestrator::OrchestratorManager;
use adventure_core::types::AdventureConfig;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "adventure-core", about = "Adventure Orchestration Core runtime")]
struct Cli {
    /// Path to an AdventureConfig JSON document. Defaults are used if omitted.
    #[arg(long)]
    config: Option<String>,

    /// Named DAG config to run (resolved against `dag_config_dir`).
    #[arg(long)]
    adventure: Option<String>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    adventure_core::observability::init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_json::from_str::<AdventureConfig>(&contents)?
        }
        None => AdventureConfig::default(),
    };
    config.validate()?;

    let bus = Arc::new(Mutex::new(EventBus::default()));
    let manager = OrchestratorManager::new(bus, config);

    if let Some(name) = cli.adventure {
        tracing::info!(adventure = %name, "starting adventure");
        manager.start_adventure(name.as_str(), Default::default()).await?;
        manager.shutdown(true).await?;
    } else {
        tracing::info!("no adventure specified; idling");
    }

    Ok(())
}
