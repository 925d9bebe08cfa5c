//! Topic provisioning
//!
//! Ensures a topic exists with the requested shape before producers or
//! consumers touch it. Provisioning is idempotent: running it against a topic
//! that already has the requested partition count and replication factor is a
//! no-op, and any mismatch is reported instead of silently accepted.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{CreateOutcome, TopicAdmin, TopicDescription, TopicSpec};
use crate::error::{BrokerError, ProvisionError};

/// Idempotent topic creator.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use kafka_events::broker::{MemoryBroker, TopicSpec};
/// use kafka_events::provisioner::TopicProvisioner;
///
/// # async fn example() -> Result<(), kafka_events::error::ProvisionError> {
/// let provisioner = TopicProvisioner::new(Arc::new(MemoryBroker::new()));
/// let spec = TopicSpec::new("user.emailevents", 1, 1);
/// provisioner.ensure_topic(&spec).await?;
/// provisioner.ensure_topic(&spec).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TopicProvisioner {
    admin: Arc<dyn TopicAdmin>,
}

impl TopicProvisioner {
    /// Creates a provisioner over an admin client.
    pub fn new(admin: Arc<dyn TopicAdmin>) -> Self {
        Self { admin }
    }

    /// Ensures `spec.name` exists with exactly the requested shape.
    ///
    /// # Errors
    ///
    /// - `ProvisionError::InvalidSpec` for an empty name or a partition count
    ///   or replication factor below 1
    /// - `ProvisionError::ConfigConflict` if the topic exists with a different
    ///   partition count or replication factor
    /// - `ProvisionError::BrokerUnavailable` if the broker cannot be reached
    pub async fn ensure_topic(&self, spec: &TopicSpec) -> Result<(), ProvisionError> {
        validate_spec(spec)?;

        if let Some(existing) = self.describe(&spec.name).await? {
            return check_compatible(spec, existing);
        }

        match self.admin.create_topic(spec).await.map_err(broker_error)? {
            CreateOutcome::Created => {
                info!(
                    topic = %spec.name,
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "Topic created"
                );
                Ok(())
            }
            CreateOutcome::AlreadyExists => {
                debug!(topic = %spec.name, "Topic created concurrently, re-checking shape");
                match self.describe(&spec.name).await? {
                    Some(existing) => check_compatible(spec, existing),
                    None => Err(ProvisionError::BrokerUnavailable(format!(
                        "topic {} reported as existing but not described",
                        spec.name
                    ))),
                }
            }
        }
    }

    /// Ensures every spec in order, stopping at the first failure.
    pub async fn ensure_all(&self, specs: &[TopicSpec]) -> Result<(), ProvisionError> {
        for spec in specs {
            self.ensure_topic(spec).await?;
        }
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<TopicDescription>, ProvisionError> {
        self.admin.describe_topic(name).await.map_err(broker_error)
    }
}

fn validate_spec(spec: &TopicSpec) -> Result<(), ProvisionError> {
    if spec.name.trim().is_empty() {
        return Err(ProvisionError::InvalidSpec(
            "topic name cannot be empty".to_string(),
        ));
    }
    if spec.partitions < 1 {
        return Err(ProvisionError::InvalidSpec(format!(
            "topic {} needs at least 1 partition, got {}",
            spec.name, spec.partitions
        )));
    }
    if spec.replication_factor < 1 {
        return Err(ProvisionError::InvalidSpec(format!(
            "topic {} needs a replication factor of at least 1, got {}",
            spec.name, spec.replication_factor
        )));
    }
    Ok(())
}

fn check_compatible(spec: &TopicSpec, existing: TopicDescription) -> Result<(), ProvisionError> {
    if existing.partitions == spec.partitions
        && existing.replication_factor == spec.replication_factor
    {
        debug!(topic = %spec.name, "Topic already provisioned");
        return Ok(());
    }

    warn!(
        topic = %spec.name,
        existing_partitions = existing.partitions,
        existing_replication = existing.replication_factor,
        requested_partitions = spec.partitions,
        requested_replication = spec.replication_factor,
        "Topic exists with a different configuration"
    );
    Err(ProvisionError::ConfigConflict {
        topic: spec.name.clone(),
        existing_partitions: existing.partitions,
        existing_replication: existing.replication_factor,
        requested_partitions: spec.partitions,
        requested_replication: spec.replication_factor,
    })
}

fn broker_error(err: BrokerError) -> ProvisionError {
    match err {
        BrokerError::Rejected(msg) => ProvisionError::InvalidSpec(msg),
        other => ProvisionError::BrokerUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerResult, MemoryBroker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provisioner(broker: &MemoryBroker) -> TopicProvisioner {
        TopicProvisioner::new(Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_creates_missing_topic() {
        let broker = MemoryBroker::new();
        provisioner(&broker)
            .ensure_topic(&TopicSpec::new("user.emailevents", 3, 1))
            .await
            .unwrap();

        let described = broker.describe_topic("user.emailevents").await.unwrap();
        assert_eq!(
            described,
            Some(TopicDescription {
                partitions: 3,
                replication_factor: 1
            })
        );
    }

    #[tokio::test]
    async fn test_second_call_is_noop() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        let spec = TopicSpec::new("user.emailevents", 1, 1);

        provisioner.ensure_topic(&spec).await.unwrap();
        provisioner.ensure_topic(&spec).await.unwrap();

        assert_eq!(broker.topic_names(), vec!["user.emailevents".to_string()]);
    }

    #[tokio::test]
    async fn test_partition_mismatch_is_conflict() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);
        provisioner
            .ensure_topic(&TopicSpec::new("user.emailevents", 1, 1))
            .await
            .unwrap();

        let err = provisioner
            .ensure_topic(&TopicSpec::new("user.emailevents", 3, 1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ProvisionError::ConfigConflict {
                topic: "user.emailevents".to_string(),
                existing_partitions: 1,
                existing_replication: 1,
                requested_partitions: 3,
                requested_replication: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_specs_rejected_before_broker() {
        let broker = MemoryBroker::new();
        let provisioner = provisioner(&broker);

        for spec in [
            TopicSpec::new("", 1, 1),
            TopicSpec::new("t", 0, 1),
            TopicSpec::new("t", 1, 0),
        ] {
            assert!(matches!(
                provisioner.ensure_topic(&spec).await,
                Err(ProvisionError::InvalidSpec(_))
            ));
        }
        assert!(broker.topic_names().is_empty());
    }

    /// Admin that loses the create race to another client.
    struct RacingAdmin {
        describes: AtomicUsize,
        winner: TopicDescription,
    }

    #[async_trait]
    impl TopicAdmin for RacingAdmin {
        async fn describe_topic(&self, _name: &str) -> BrokerResult<Option<TopicDescription>> {
            if self.describes.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(None)
            } else {
                Ok(Some(self.winner))
            }
        }

        async fn create_topic(&self, _spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    #[tokio::test]
    async fn test_create_race_rechecks_shape() {
        let admin = Arc::new(RacingAdmin {
            describes: AtomicUsize::new(0),
            winner: TopicDescription {
                partitions: 1,
                replication_factor: 1,
            },
        });
        let provisioner = TopicProvisioner::new(admin.clone());

        provisioner
            .ensure_topic(&TopicSpec::new("t", 1, 1))
            .await
            .unwrap();
        assert!(matches!(
            provisioner.ensure_topic(&TopicSpec::new("t", 2, 1)).await,
            Err(ProvisionError::ConfigConflict { .. })
        ));
        assert_eq!(admin.describes.load(Ordering::SeqCst), 3);
    }

    struct DownAdmin;

    #[async_trait]
    impl TopicAdmin for DownAdmin {
        async fn describe_topic(&self, _name: &str) -> BrokerResult<Option<TopicDescription>> {
            Err(BrokerError::Unavailable("connection refused".to_string()))
        }

        async fn create_topic(&self, _spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
            Err(BrokerError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let provisioner = TopicProvisioner::new(Arc::new(DownAdmin));
        let err = provisioner
            .ensure_topic(&TopicSpec::new("t", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BrokerUnavailable(msg) if msg.contains("refused")));
    }
}
