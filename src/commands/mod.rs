/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `provision`: Create the event topic and its retry chain
- `publish`: Publish one registration event
- `consume`: Run the confirmation consumer until interrupted
- `serve`: HTTP boundary plus the confirmation consumer
- `drain`: One-shot bounded read of a topic
- `replay`: Move dead-lettered records back to the event topic

Every handler starts by building the broker selected in the configuration
and provisioning the event topic, so a misconfigured topic stops the process
before anything is produced or consumed.
*/

use crate::broker::{Broker, KafkaBroker, MemoryBroker, TopicSpec};
use crate::config::{BrokerBackend, Config};
use crate::consumer::{ConfirmationEmailHandler, DrainEndpoint, RetryTopology, RetryableConsumer};
use crate::error::Result;
use crate::producer::EventProducer;
use crate::provisioner::TopicProvisioner;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

/// Builds the broker selected by `config.broker`.
///
/// # Errors
///
/// Returns error if the Kafka settings are invalid or the clients cannot be
/// created.
pub fn build_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    match config.broker {
        BrokerBackend::Kafka => {
            let settings = config.kafka.to_settings()?;
            let broker = KafkaBroker::new(settings).context("Failed to create Kafka clients")?;
            Ok(Arc::new(broker))
        }
        BrokerBackend::Memory => {
            tracing::warn!("Using the in-memory broker; events are lost on exit");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

/// Topic shape from configuration.
pub fn topic_spec(config: &Config) -> TopicSpec {
    TopicSpec::new(
        &config.topic.name,
        config.topic.partitions,
        config.topic.replication_factor,
    )
}

/// Ensures the event topic exists with the configured shape.
///
/// # Errors
///
/// Returns error on a configuration conflict or an unreachable broker.
pub async fn provision_topic(broker: &Arc<dyn Broker>, config: &Config) -> Result<()> {
    let provisioner = TopicProvisioner::new(Arc::clone(broker).into_admin());
    provisioner
        .ensure_topic(&topic_spec(config))
        .await
        .with_context(|| format!("Failed to provision topic {}", config.topic.name))?;
    Ok(())
}

/// Builds the steady-state consumer from configuration.
pub fn retryable_consumer(broker: &Arc<dyn Broker>, config: &Config) -> RetryableConsumer {
    RetryableConsumer::new(Arc::clone(broker), config.retry.clone())
        .with_handler_timeout(config.handler_timeout())
        .with_redelivery_backoff(config.redelivery_backoff())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// Provision command handler
pub mod provision {
    //! Creates the event topic, its retry topics and its dead-letter topic.

    use super::*;

    /// Provision every topic of the pipeline.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    ///
    /// # Errors
    ///
    /// Returns error on a configuration conflict or an unreachable broker
    pub async fn run_provision(config: Config) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let base = topic_spec(&config);
        let topology = RetryTopology::new(&base.name, config.retry.max_attempts);
        let mut chain: Vec<TopicSpec> = topology
            .topics()
            .into_iter()
            .skip(1)
            .map(|name| base.renamed(name))
            .collect();
        chain.push(base.renamed(topology.dead_letter_topic()));

        let provisioner = TopicProvisioner::new(Arc::clone(&broker).into_admin());
        provisioner.ensure_all(&chain).await?;

        println!("Provisioned {}", base.name);
        for spec in &chain {
            println!("Provisioned {}", spec.name);
        }
        Ok(())
    }
}

// Publish command handler
pub mod publish {
    //! Publishes a single registration event from the command line.

    use super::*;
    use crate::envelope::UserRegistered;

    /// Publish one registration event and print its acknowledgement.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `username` - Registered username
    /// * `email` - Confirmation address
    ///
    /// # Errors
    ///
    /// Returns error if provisioning or publishing fails
    pub async fn run_publish(config: Config, username: String, email: String) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let producer = EventProducer::new(Arc::clone(&broker).into_sink(), &config.topic.name);
        let ack = producer
            .publish(UserRegistered::new(username, email))
            .await
            .context("Failed to publish registration event")?;

        println!(
            "Published event {} to {} [partition {}, offset {}]",
            ack.event_id, config.topic.name, ack.partition, ack.offset
        );
        Ok(())
    }
}

// Consume command handler
pub mod consume {
    //! Runs the confirmation consumer until Ctrl-C.

    use super::*;
    use crate::envelope::UserRegistered;

    /// Consume registration events until interrupted.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `group` - Optional override of the consumer group
    ///
    /// # Errors
    ///
    /// Returns error if provisioning or subscribing fails
    pub async fn run_consume(config: Config, group: Option<String>) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let group_id = group.unwrap_or_else(|| config.consumer.group_id.clone());
        let subscription = retryable_consumer(&broker, &config)
            .subscribe::<UserRegistered>(
                &config.topic.name,
                &group_id,
                Arc::new(ConfirmationEmailHandler::new()),
            )
            .await
            .context("Failed to subscribe")?;

        tracing::info!(
            group_id = %group_id,
            topics = ?subscription.topics(),
            "Consuming; press Ctrl-C to stop"
        );
        shutdown_signal().await;
        subscription.shutdown().await;
        Ok(())
    }
}

// Serve command handler
pub mod serve {
    //! HTTP boundary with the confirmation consumer running alongside.

    use super::*;
    use crate::envelope::UserRegistered;
    use crate::http::{router, AppState};

    /// Serve the HTTP API until interrupted.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `bind` - Optional override of the listen address
    /// * `no_consumer` - Skip the steady-state consumer
    ///
    /// # Errors
    ///
    /// Returns error if provisioning, subscribing or binding fails
    pub async fn run_serve(config: Config, bind: Option<String>, no_consumer: bool) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let handler = Arc::new(ConfirmationEmailHandler::new());
        let subscription = if no_consumer {
            None
        } else {
            Some(
                retryable_consumer(&broker, &config)
                    .subscribe::<UserRegistered>(
                        &config.topic.name,
                        &config.consumer.group_id,
                        handler.clone(),
                    )
                    .await
                    .context("Failed to subscribe")?,
            )
        };

        let state = AppState {
            producer: Arc::new(EventProducer::new(
                Arc::clone(&broker).into_sink(),
                &config.topic.name,
            )),
            drain: DrainEndpoint::new(Arc::clone(&broker), &config.drain.group_id),
            handler,
            topic: config.topic.name.clone(),
            drain_max_records: config.drain.max_records,
            drain_timeout: config.drain_timeout(),
        };

        let addr = bind.unwrap_or_else(|| config.http.bind.clone());
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        tracing::info!("Listening on {}", addr);

        axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;

        if let Some(subscription) = subscription {
            subscription.shutdown().await;
        }
        Ok(())
    }
}

// Drain command handler
pub mod drain {
    //! One-shot drain printing events as JSON lines.

    use super::*;
    use crate::envelope::UserRegistered;

    /// Drain a topic once and print the events.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `topic` - Topic override; defaults to the event topic
    /// * `max_records` - Override of `drain.max_records`
    /// * `timeout_ms` - Override of `drain.timeout_ms`
    ///
    /// # Errors
    ///
    /// Returns error if the broker cannot be read
    pub async fn run_drain(
        config: Config,
        topic: Option<String>,
        max_records: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let topic = topic.unwrap_or_else(|| config.topic.name.clone());
        let max_records = max_records.unwrap_or(config.drain.max_records);
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.drain_timeout());

        let drain = DrainEndpoint::new(broker, &config.drain.group_id);
        let events = drain
            .drain_once::<UserRegistered>(&topic, max_records, timeout)
            .await
            .with_context(|| format!("Failed to drain {}", topic))?;

        for event in &events {
            println!("{}", serde_json::to_string(event)?);
        }
        eprintln!("Drained {} event(s) from {}", events.len(), topic);
        Ok(())
    }
}

// Replay command handler
pub mod replay {
    //! Moves dead-lettered records back onto the event topic.

    use super::*;

    /// Replay the dead-letter topic into the event topic.
    ///
    /// # Arguments
    ///
    /// * `config` - Loaded configuration
    /// * `max_records` - Override of `drain.max_records`
    /// * `timeout_ms` - Override of `drain.timeout_ms`
    ///
    /// # Errors
    ///
    /// Returns error if reading or writing fails
    pub async fn run_replay(
        config: Config,
        max_records: Option<usize>,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let broker = build_broker(&config)?;
        provision_topic(&broker, &config).await?;

        let topology = RetryTopology::new(&config.topic.name, config.retry.max_attempts);
        let dlt = topology.dead_letter_topic();
        let provisioner = TopicProvisioner::new(Arc::clone(&broker).into_admin());
        provisioner
            .ensure_topic(&topic_spec(&config).renamed(&dlt))
            .await?;

        let max_records = max_records.unwrap_or(config.drain.max_records);
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.drain_timeout());

        let drain = DrainEndpoint::new(broker, &config.drain.group_id);
        let count = drain
            .replay(&dlt, &config.topic.name, max_records, timeout)
            .await
            .context("Replay failed")?;

        println!("Replayed {} record(s) from {} to {}", count, dlt, config.topic.name);
        Ok(())
    }
}
