//! Kafka broker backed by rdkafka.
//!
//! One admin client and one idempotent producer are shared by the whole
//! process; every subscription gets its own `StreamConsumer` so each
//! consumer loop owns its partition assignment.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafka_events::broker::{Broker, KafkaBroker, KafkaSettings};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = KafkaSettings::new("localhost:9092");
//! let broker: Arc<dyn Broker> = Arc::new(KafkaBroker::new(settings)?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::kafka_config::{client_config, KafkaSettings};
use super::{
    Broker, BrokerResult, CreateOutcome, Headers, InboundRecord, OutboundRecord, RecordAck,
    RecordSink, RecordSource, TopicAdmin, TopicDescription, TopicSpec,
};
use crate::error::BrokerError;

/// Maps an rdkafka error onto the broker seam taxonomy.
///
/// Errors about the record or request itself are rejections; everything
/// else (timeouts, transport, leader elections) is treated as unavailability.
fn classify(err: &KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidPartitions
            | RDKafkaErrorCode::InvalidReplicationFactor
            | RDKafkaErrorCode::PolicyViolation
            | RDKafkaErrorCode::TopicAuthorizationFailed,
        ) => BrokerError::Rejected(err.to_string()),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::UnknownTopic(err.to_string())
        }
        _ => BrokerError::Unavailable(err.to_string()),
    }
}

fn creation_error(err: KafkaError) -> BrokerError {
    BrokerError::Rejected(format!("invalid client configuration: {}", err))
}

/// Production broker: Kafka through librdkafka.
pub struct KafkaBroker {
    settings: KafkaSettings,
    admin: Arc<AdminClient<DefaultClientContext>>,
    producer: FutureProducer,
}

impl KafkaBroker {
    /// Creates the shared admin client and producer.
    ///
    /// No network round-trip happens here; connection problems surface on
    /// the first operation.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Rejected` if librdkafka refuses the settings.
    pub fn new(settings: KafkaSettings) -> Result<Self, BrokerError> {
        info!(
            brokers = %settings.brokers,
            security_protocol = %settings.security_protocol.as_str(),
            "Creating Kafka clients"
        );

        let admin: AdminClient<DefaultClientContext> = client_config(&settings.admin_settings())
            .create()
            .map_err(creation_error)?;
        let producer: FutureProducer = client_config(&settings.producer_settings())
            .create()
            .map_err(creation_error)?;

        Ok(Self {
            settings,
            admin: Arc::new(admin),
            producer,
        })
    }

    /// Settings the clients were built from.
    pub fn settings(&self) -> &KafkaSettings {
        &self.settings
    }
}

#[async_trait]
impl TopicAdmin for KafkaBroker {
    async fn describe_topic(&self, name: &str) -> BrokerResult<Option<TopicDescription>> {
        let admin = Arc::clone(&self.admin);
        let timeout = self.settings.request_timeout;
        let name = name.to_string();

        // Full metadata so the request never triggers broker-side auto-creation.
        tokio::task::spawn_blocking(move || {
            let metadata = admin
                .inner()
                .fetch_metadata(None, timeout)
                .map_err(|e| classify(&e))?;

            let Some(topic) = metadata.topics().iter().find(|t| t.name() == name) else {
                return Ok(None);
            };
            if let Some(err) = topic.error() {
                let code = RDKafkaErrorCode::from(err);
                if code == RDKafkaErrorCode::UnknownTopicOrPartition {
                    return Ok(None);
                }
                return Err(BrokerError::Unavailable(format!(
                    "metadata for {}: {}",
                    name, code
                )));
            }

            let partitions = topic.partitions();
            Ok(Some(TopicDescription {
                partitions: partitions.len() as i32,
                replication_factor: partitions
                    .first()
                    .map(|p| p.replicas().len() as i32)
                    .unwrap_or(0),
            }))
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("metadata task failed: {}", e)))?
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.settings.request_timeout));

        let results = self
            .admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| classify(&e))?;

        match results.into_iter().next() {
            Some(Ok(name)) => {
                info!(topic = %name, partitions = spec.partitions, "Created Kafka topic");
                Ok(CreateOutcome::Created)
            }
            Some(Err((_, RDKafkaErrorCode::TopicAlreadyExists))) => Ok(CreateOutcome::AlreadyExists),
            Some(Err((name, code))) => {
                let err = KafkaError::AdminOp(code);
                warn!(topic = %name, error = %code, "Topic creation failed");
                Err(classify(&err))
            }
            None => Err(BrokerError::Unavailable(format!(
                "no result for topic {}",
                spec.name
            ))),
        }
    }
}

#[async_trait]
impl RecordSink for KafkaBroker {
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordAck> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        let mut future_record = FutureRecord::<str, Vec<u8>>::to(&record.topic)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            future_record = future_record.key(key.as_str());
        }

        match self
            .producer
            .send(future_record, Timeout::After(self.settings.request_timeout))
            .await
        {
            Ok((partition, offset)) => Ok(RecordAck { partition, offset }),
            Err((err, _)) => Err(classify(&err)),
        }
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BrokerResult<Box<dyn RecordSource>> {
        let consumer: StreamConsumer = client_config(&self.settings.consumer_settings(group_id))
            .create()
            .map_err(creation_error)?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs).map_err(|e| classify(&e))?;

        debug!(group_id = %group_id, ?topics, "Kafka consumer subscribed");
        Ok(Box::new(KafkaSource {
            consumer,
            seek_timeout: self.settings.request_timeout,
        }))
    }

    async fn assign(&self, topic: &str, group_id: &str) -> BrokerResult<Box<dyn RecordSource>> {
        let partitions = self
            .describe_topic(topic)
            .await?
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .partitions;

        let consumer: StreamConsumer = client_config(&self.settings.consumer_settings(group_id))
            .create()
            .map_err(creation_error)?;
        let assignment = stored_offsets(topic, partitions).map_err(|e| classify(&e))?;
        consumer.assign(&assignment).map_err(|e| classify(&e))?;

        debug!(group_id = %group_id, topic = %topic, partitions, "Kafka consumer assigned");
        Ok(Box::new(KafkaSource {
            consumer,
            seek_timeout: self.settings.request_timeout,
        }))
    }

    fn into_admin(self: Arc<Self>) -> Arc<dyn TopicAdmin> {
        self
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn RecordSink> {
        self
    }
}

/// Every partition of `topic`, each starting at the group's committed offset
/// (`auto.offset.reset` when none is committed).
fn stored_offsets(topic: &str, partitions: i32) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for partition in 0..partitions {
        tpl.add_partition_offset(topic, partition, Offset::Stored)?;
    }
    Ok(tpl)
}

/// Reader over a Kafka consumer, either a group member or directly assigned.
pub struct KafkaSource {
    consumer: StreamConsumer,
    seek_timeout: Duration,
}

fn to_inbound<M: Message>(message: &M) -> InboundRecord {
    let mut headers = Headers::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, partition);
    tpl
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn recv(&mut self) -> BrokerResult<InboundRecord> {
        let message = self.consumer.recv().await.map_err(|e| classify(&e))?;
        Ok(to_inbound(&message))
    }

    fn ack(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        self.consumer
            .store_offset(&record.topic, record.partition, record.offset + 1)
            .map_err(|e| classify(&e))
    }

    fn rewind_and_pause(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        self.consumer
            .pause(&single_partition(&record.topic, record.partition))
            .map_err(|e| classify(&e))?;
        self.consumer
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                self.seek_timeout,
            )
            .map_err(|e| classify(&e))
    }

    fn resume(&mut self, topic: &str, partition: i32) -> BrokerResult<()> {
        self.consumer
            .resume(&single_partition(topic, partition))
            .map_err(|e| classify(&e))
    }

    async fn close(self: Box<Self>) {
        let consumer = self.consumer;
        consumer.unsubscribe();
        // Dropping the consumer commits stored offsets and leaves the group; it blocks.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(consumer)).await {
            warn!(error = %e, "Kafka consumer close task failed");
        }
    }
}
