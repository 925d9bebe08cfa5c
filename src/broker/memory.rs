//! In-memory broker for tests and local development
//!
//! A partitioned, append-only log per topic with broker-side offsets per
//! consumer group. Each partition is owned by at most one live source per
//! group, so several consumers sharing a group split the partitions the way
//! Kafka group coordination does (first come, first served; partitions move
//! to another member once their owner closes).

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    Broker, BrokerResult, CreateOutcome, Headers, InboundRecord, OutboundRecord, RecordAck,
    RecordSink, RecordSource, TopicAdmin, TopicDescription, TopicSpec,
};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    headers: Headers,
}

#[derive(Debug)]
struct TopicLog {
    replication_factor: i32,
    partitions: Vec<Vec<StoredRecord>>,
}

type GroupPartition = (String, String, i32);

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    committed: HashMap<GroupPartition, i64>,
    owners: HashMap<GroupPartition, u64>,
    next_member: u64,
    next_partition: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Broker implementation backed by process memory
///
/// Cloning is cheap and every clone sees the same log.
///
/// # Example
///
/// ```rust
/// use kafka_events::broker::{MemoryBroker, OutboundRecord, RecordSink, TopicAdmin, TopicSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = MemoryBroker::new();
/// broker.create_topic(&TopicSpec::new("events", 1, 1)).await?;
/// let ack = broker
///     .send(OutboundRecord::new("events", None, b"{}".to_vec()))
///     .await?;
/// assert_eq!(ack.offset, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every record of a topic, partition by partition in offset order.
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        let state = self.shared.lock();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        log.partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, stored)| {
                    to_inbound(topic, partition as i32, offset as i64, stored)
                })
            })
            .collect()
    }

    /// Position stored for a group on a partition, if any.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.shared.lock();
        state
            .committed
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Names of all existing topics, sorted.
    pub fn topic_names(&self) -> Vec<String> {
        let state = self.shared.lock();
        let mut names: Vec<String> = state.topics.keys().cloned().collect();
        names.sort();
        names
    }
}

fn to_inbound(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> InboundRecord {
    InboundRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        headers: stored.headers.clone(),
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

#[async_trait]
impl TopicAdmin for MemoryBroker {
    async fn describe_topic(&self, name: &str) -> BrokerResult<Option<TopicDescription>> {
        let state = self.shared.lock();
        Ok(state.topics.get(name).map(|log| TopicDescription {
            partitions: log.partitions.len() as i32,
            replication_factor: log.replication_factor,
        }))
    }

    async fn create_topic(&self, spec: &TopicSpec) -> BrokerResult<CreateOutcome> {
        if spec.partitions < 1 || spec.replication_factor < 1 {
            return Err(BrokerError::Rejected(format!(
                "topic {} needs at least one partition and one replica",
                spec.name
            )));
        }
        let mut state = self.shared.lock();
        if state.topics.contains_key(&spec.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state.topics.insert(
            spec.name.clone(),
            TopicLog {
                replication_factor: spec.replication_factor,
                partitions: vec![Vec::new(); spec.partitions as usize],
            },
        );
        debug!(topic = %spec.name, partitions = spec.partitions, "Created in-memory topic");
        Ok(CreateOutcome::Created)
    }
}

#[async_trait]
impl RecordSink for MemoryBroker {
    async fn send(&self, record: OutboundRecord) -> BrokerResult<RecordAck> {
        let ack = {
            let mut state = self.shared.lock();
            let round_robin = state.next_partition;
            let log = state
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| BrokerError::UnknownTopic(record.topic.clone()))?;

            let count = log.partitions.len();
            let partition = match &record.key {
                Some(key) => partition_for(key, count),
                None => round_robin % count,
            };
            let records = &mut log.partitions[partition];
            records.push(StoredRecord {
                key: record.key,
                payload: record.payload,
                headers: record.headers,
            });
            let offset = records.len() as i64 - 1;
            state.next_partition = round_robin.wrapping_add(1);

            RecordAck {
                partition: partition as i32,
                offset,
            }
        };
        self.shared.notify.notify_waiters();
        Ok(ack)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        topics: &[String],
        group_id: &str,
    ) -> BrokerResult<Box<dyn RecordSource>> {
        let member = {
            let mut state = self.shared.lock();
            state.next_member += 1;
            state.next_member
        };
        debug!(group_id = %group_id, member, ?topics, "In-memory consumer joined group");
        Ok(Box::new(MemorySource {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            topics: topics.to_vec(),
            member,
            assigned: false,
            positions: HashMap::new(),
            paused: HashSet::new(),
            cursor: 0,
        }))
    }

    async fn assign(&self, topic: &str, group_id: &str) -> BrokerResult<Box<dyn RecordSource>> {
        if !self.shared.lock().topics.contains_key(topic) {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        debug!(group_id = %group_id, topic = %topic, "In-memory consumer assigned all partitions");
        Ok(Box::new(MemorySource {
            shared: Arc::clone(&self.shared),
            group_id: group_id.to_string(),
            topics: vec![topic.to_string()],
            member: 0,
            assigned: true,
            positions: HashMap::new(),
            paused: HashSet::new(),
            cursor: 0,
        }))
    }

    fn into_admin(self: Arc<Self>) -> Arc<dyn TopicAdmin> {
        self
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn RecordSink> {
        self
    }
}

/// Group member reading from a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySource {
    shared: Arc<Shared>,
    group_id: String,
    topics: Vec<String>,
    member: u64,
    /// Reads every partition without taking part in group ownership.
    assigned: bool,
    positions: HashMap<(String, i32), i64>,
    paused: HashSet<(String, i32)>,
    cursor: usize,
}

impl MemorySource {
    fn try_next(&mut self) -> Option<InboundRecord> {
        let mut state = self.shared.lock();

        let mut candidates = Vec::new();
        for topic in &self.topics {
            if let Some(log) = state.topics.get(topic) {
                for partition in 0..log.partitions.len() as i32 {
                    candidates.push((topic.clone(), partition));
                }
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let count = candidates.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let (topic, partition) = &candidates[index];
            let tp = (topic.clone(), *partition);
            if self.paused.contains(&tp) {
                continue;
            }

            let owner_key = (self.group_id.clone(), topic.clone(), *partition);
            if !self.assigned {
                match state.owners.get(&owner_key).copied() {
                    Some(owner) if owner != self.member => continue,
                    Some(_) => {}
                    None => {
                        state.owners.insert(owner_key.clone(), self.member);
                        // Fresh assignment starts from the group position.
                        self.positions.remove(&tp);
                    }
                }
            }

            let committed = state.committed.get(&owner_key).copied().unwrap_or(0);
            let position = *self.positions.entry(tp.clone()).or_insert(committed);
            let log = &state.topics[topic];
            if let Some(stored) = log.partitions[*partition as usize].get(position as usize) {
                let record = to_inbound(topic, *partition, position, stored);
                self.positions.insert(tp, position + 1);
                self.cursor = index + 1;
                return Some(record);
            }
        }
        None
    }

    fn release(&mut self) {
        if self.assigned {
            return;
        }
        let mut state = self.shared.lock();
        let member = self.member;
        state.owners.retain(|_, owner| *owner != member);
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn recv(&mut self) -> BrokerResult<InboundRecord> {
        loop {
            let shared = Arc::clone(&self.shared);
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.try_next() {
                return Ok(record);
            }
            notified.await;
        }
    }

    fn ack(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        let key = (
            self.group_id.clone(),
            record.topic.clone(),
            record.partition,
        );
        let next = record.offset + 1;
        let entry = state.committed.entry(key).or_insert(next);
        if *entry < next {
            *entry = next;
        }
        Ok(())
    }

    fn rewind_and_pause(&mut self, record: &InboundRecord) -> BrokerResult<()> {
        let tp = (record.topic.clone(), record.partition);
        self.positions.insert(tp.clone(), record.offset);
        self.paused.insert(tp);
        Ok(())
    }

    fn resume(&mut self, topic: &str, partition: i32) -> BrokerResult<()> {
        self.paused.remove(&(topic.to_string(), partition));
        Ok(())
    }

    async fn close(self: Box<Self>) {
        debug!(group_id = %self.group_id, member = self.member, "In-memory consumer left group");
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.release();
    }
}
