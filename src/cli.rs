//! Command-line interface definition for kafka-events
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to serve the HTTP boundary, run consumers, publish,
//! drain, provision and replay.

use clap::{Parser, Subcommand};

/// kafka-events - user registration event pipeline
///
/// Publishes user registration events to Kafka and sends confirmation
/// emails from a retrying consumer.
#[derive(Parser, Debug, Clone)]
#[command(name = "kafka-events")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the Kafka bootstrap servers from config
    #[arg(long, global = true)]
    pub brokers: Option<String>,

    /// Override the broker backend (kafka, memory)
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve the HTTP API and run the confirmation consumer
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8080
        #[arg(short, long)]
        bind: Option<String>,

        /// Do not start the steady-state consumer
        #[arg(long)]
        no_consumer: bool,
    },

    /// Run the confirmation consumer until interrupted
    Consume {
        /// Override the consumer group from config
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Publish a user registration event
    Publish {
        /// Username of the registered user
        #[arg(short, long)]
        username: String,

        /// Email address the confirmation goes to
        #[arg(short, long)]
        email: String,
    },

    /// Drain waiting events once and print them
    Drain {
        /// Topic to drain (defaults to the configured topic)
        #[arg(short, long)]
        topic: Option<String>,

        /// Maximum number of events to return
        #[arg(long)]
        max_records: Option<usize>,

        /// Upper bound on the drain in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Create the topic and its retry chain if missing
    Provision,

    /// Move dead-lettered records back to the base topic
    Replay {
        /// Maximum number of records to replay
        #[arg(long)]
        max_records: Option<usize>,

        /// Upper bound on the replay in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            brokers: None,
            backend: None,
            command: Commands::Provision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default() {
        let cli = Cli::default();
        assert_eq!(cli.config, Some("config/config.yaml".to_string()));
        assert!(!cli.verbose);
        assert!(matches!(cli.command, Commands::Provision));
    }

    #[test]
    fn test_cli_parse_serve() {
        let cli = Cli::try_parse_from(["kafka-events", "serve", "--bind", "127.0.0.1:9000"]).unwrap();
        if let Commands::Serve { bind, no_consumer } = cli.command {
            assert_eq!(bind, Some("127.0.0.1:9000".to_string()));
            assert!(!no_consumer);
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_cli_parse_publish_requires_fields() {
        assert!(Cli::try_parse_from(["kafka-events", "publish", "--username", "alice"]).is_err());

        let cli = Cli::try_parse_from([
            "kafka-events",
            "publish",
            "--username",
            "alice",
            "--email",
            "a@x.com",
        ])
        .unwrap();
        if let Commands::Publish { username, email } = cli.command {
            assert_eq!(username, "alice");
            assert_eq!(email, "a@x.com");
        } else {
            panic!("Expected Publish command");
        }
    }

    #[test]
    fn test_cli_parse_drain_options() {
        let cli = Cli::try_parse_from([
            "kafka-events",
            "drain",
            "--topic",
            "user.emailevents-dlt",
            "--max-records",
            "5",
            "--timeout-ms",
            "250",
        ])
        .unwrap();
        if let Commands::Drain {
            topic,
            max_records,
            timeout_ms,
        } = cli.command
        {
            assert_eq!(topic, Some("user.emailevents-dlt".to_string()));
            assert_eq!(max_records, Some(5));
            assert_eq!(timeout_ms, Some(250));
        } else {
            panic!("Expected Drain command");
        }
    }

    #[test]
    fn test_cli_global_overrides_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kafka-events",
            "consume",
            "--backend",
            "memory",
            "--brokers",
            "k1:9092",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some("memory".to_string()));
        assert_eq!(cli.brokers, Some("k1:9092".to_string()));
    }

    #[test]
    fn test_cli_parse_replay_and_provision() {
        let cli = Cli::try_parse_from(["kafka-events", "replay", "--max-records", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Replay {
                max_records: Some(3),
                timeout_ms: None
            }
        ));

        let cli = Cli::try_parse_from(["kafka-events", "provision"]).unwrap();
        assert!(matches!(cli.command, Commands::Provision));
    }

    #[test]
    fn test_cli_verbose_and_config() {
        let cli =
            Cli::try_parse_from(["kafka-events", "-v", "-c", "custom.yaml", "provision"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some("custom.yaml".to_string()));
    }
}
