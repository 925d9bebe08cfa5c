use async_trait::async_trait;
use kafka_events::broker::{Broker, MemoryBroker, TopicAdmin, TopicSpec};
use kafka_events::consumer::EventHandler;
use kafka_events::envelope::{EventEnvelope, UserRegistered};
use kafka_events::error::HandlerError;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const TOPIC: &str = "user.emailevents";
pub const GROUP: &str = "user-event-group";

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// In-memory broker with the event topic already created.
#[allow(dead_code)]
pub async fn broker_with_topic(partitions: i32) -> (MemoryBroker, Arc<dyn Broker>) {
    let broker = MemoryBroker::new();
    broker
        .create_topic(&TopicSpec::new(TOPIC, partitions, 1))
        .await
        .expect("failed to create topic");
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());
    (broker, shared)
}

/// Polls `condition` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler recording every invocation, failing the first `failures` calls.
#[allow(dead_code)]
pub struct RecordingHandler {
    calls: Mutex<Vec<(EventEnvelope<UserRegistered>, Instant)>>,
    failures: usize,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn succeeding() -> Arc<Self> {
        Self::failing_times(0)
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing_times(usize::MAX)
    }

    pub fn failing_times(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures,
            delay: None,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: 0,
            delay: Some(delay),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<EventEnvelope<UserRegistered>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl EventHandler<UserRegistered> for RecordingHandler {
    async fn handle(&self, event: &EventEnvelope<UserRegistered>) -> Result<(), HandlerError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((event.clone(), Instant::now()));
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call <= self.failures {
            Err(format!("simulated failure on call {}", call).into())
        } else {
            Ok(())
        }
    }
}
