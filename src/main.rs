//! kafka-events - user registration event pipeline
//!
#![doc = "Main entry point for the kafka-events binary."]

use anyhow::Result;
use clap::Parser;

use kafka_events::cli::{Cli, Commands};
use kafka_events::commands;
use kafka_events::config::Config;
use kafka_events::logging::init_logging;
use kafka_events::telemetry::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Initialize logging from the merged configuration
    init_logging(&config.logging)?;
    init_metrics_exporter();

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Serve { bind, no_consumer } => {
            tracing::info!("Starting HTTP service");
            commands::serve::run_serve(config, bind, no_consumer).await?;
            Ok(())
        }
        Commands::Consume { group } => {
            tracing::info!("Starting confirmation consumer");
            if let Some(g) = &group {
                tracing::debug!("Using consumer group override: {}", g);
            }
            commands::consume::run_consume(config, group).await?;
            Ok(())
        }
        Commands::Publish { username, email } => {
            tracing::info!("Publishing registration event");
            commands::publish::run_publish(config, username, email).await?;
            Ok(())
        }
        Commands::Drain {
            topic,
            max_records,
            timeout_ms,
        } => {
            tracing::info!("Starting manual drain");
            commands::drain::run_drain(config, topic, max_records, timeout_ms).await?;
            Ok(())
        }
        Commands::Provision => {
            tracing::info!("Provisioning topics");
            commands::provision::run_provision(config).await?;
            Ok(())
        }
        Commands::Replay {
            max_records,
            timeout_ms,
        } => {
            tracing::info!("Replaying dead-lettered records");
            commands::replay::run_replay(config, max_records, timeout_ms).await?;
            Ok(())
        }
    }
}
