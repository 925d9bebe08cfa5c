//! Configuration management for kafka-events
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//!
//! Precedence, lowest first: built-in defaults, the YAML file, `KAFKA_*` and
//! `EVENTS_*` environment variables, then command-line flags.

use crate::broker::{KafkaSettings, SaslConfig, SaslMechanism, SecurityProtocol, SslConfig};
use crate::consumer::{BackoffPolicy, RetryPolicy};
use crate::error::{EventsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker backend
    #[serde(default)]
    pub broker: BrokerBackend,

    /// Kafka connection settings
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Event topic shape
    #[serde(default)]
    pub topic: TopicConfig,

    /// Steady-state consumer settings
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Retry chain settings
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Manual drain settings
    #[serde(default)]
    pub drain: DrainConfig,

    /// HTTP boundary settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which broker implementation to run against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Apache Kafka
    #[default]
    Kafka,
    /// In-process log; nothing survives a restart
    Memory,
}

impl BrokerBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "kafka" => Some(Self::Kafka),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Kafka connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Kafka brokers (comma-separated)
    #[serde(default = "default_brokers")]
    pub brokers: String,

    /// Client id prefix
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Security configuration
    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,

    /// Where a group without stored offsets starts
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Consumer group session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Admin, metadata and delivery timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Kafka security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password (prefer env var KAFKA_SASL_PASSWORD)
    #[serde(default)]
    pub sasl_password: Option<String>,

    /// CA certificate path
    #[serde(default)]
    pub ssl_ca_location: Option<String>,

    /// Client certificate path for mTLS
    #[serde(default)]
    pub ssl_certificate_location: Option<String>,

    /// Client key path for mTLS
    #[serde(default)]
    pub ssl_key_location: Option<String>,
}

impl KafkaSecurityConfig {
    fn plaintext() -> Self {
        Self {
            protocol: SecurityProtocol::Plaintext.as_str().to_string(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            ssl_certificate_location: None,
            ssl_key_location: None,
        }
    }
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "kafka-events".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            client_id: default_client_id(),
            security: None,
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl KafkaConfig {
    /// Builds client settings from this configuration.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown protocol or mechanism, or when a SASL
    /// protocol is missing credentials.
    pub fn to_settings(&self) -> Result<KafkaSettings> {
        let mut settings = KafkaSettings::new(&self.brokers)
            .with_client_id(&self.client_id)
            .with_auto_offset_reset(&self.auto_offset_reset)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        settings.session_timeout = Duration::from_millis(self.session_timeout_ms);

        if let Some(security) = &self.security {
            settings.security_protocol = SecurityProtocol::parse(&security.protocol)
                .map_err(|e| EventsError::Config(e.to_string()))?;

            if let (Some(username), Some(password)) =
                (&security.sasl_username, &security.sasl_password)
            {
                let mechanism = match &security.sasl_mechanism {
                    Some(m) => {
                        SaslMechanism::parse(m).map_err(|e| EventsError::Config(e.to_string()))?
                    }
                    None => SaslMechanism::ScramSha256,
                };
                settings.sasl_config = Some(SaslConfig {
                    mechanism,
                    username: username.clone(),
                    password: password.clone(),
                });
            }

            if security.ssl_ca_location.is_some()
                || security.ssl_certificate_location.is_some()
                || security.ssl_key_location.is_some()
            {
                settings.ssl_config = Some(SslConfig {
                    ca_location: security.ssl_ca_location.clone(),
                    certificate_location: security.ssl_certificate_location.clone(),
                    key_location: security.ssl_key_location.clone(),
                });
            }
        }

        settings
            .validate()
            .map_err(|e| EventsError::Config(e.to_string()))?;
        Ok(settings)
    }

    fn security_mut(&mut self) -> &mut KafkaSecurityConfig {
        self.security.get_or_insert_with(KafkaSecurityConfig::plaintext)
    }
}

/// Event topic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Base topic name
    #[serde(default = "default_topic_name")]
    pub name: String,

    /// Partition count
    #[serde(default = "default_partitions")]
    pub partitions: i32,

    /// Replication factor
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

fn default_topic_name() -> String {
    "user.emailevents".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            name: default_topic_name(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// Steady-state consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group ID
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Bound on one handler invocation in milliseconds
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Pause before re-reading a record whose forward failed, in milliseconds
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
}

fn default_group_id() -> String {
    "user-event-group".to_string()
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_redelivery_backoff_ms() -> u64 {
    1_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            handler_timeout_ms: default_handler_timeout_ms(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
        }
    }
}

/// Manual drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Consumer group used by drains; sharing the steady-state group makes
    /// drains compete with running consumers for partitions
    #[serde(default = "default_drain_group_id")]
    pub group_id: String,

    /// Maximum events per drain
    #[serde(default = "default_drain_max_records")]
    pub max_records: usize,

    /// Upper bound on one drain in milliseconds
    #[serde(default = "default_drain_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_drain_group_id() -> String {
    crate::consumer::DEFAULT_DRAIN_GROUP.to_string()
}

fn default_drain_max_records() -> usize {
    100
}

fn default_drain_timeout_ms() -> u64 {
    1_000
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            group_id: default_drain_group_id(),
            max_records: default_drain_max_records(),
            timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// HTTP boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

/// Reads an environment variable and parses it, warning on bad values.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {}: {}", name, raw);
            None
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EventsError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| EventsError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        // Kafka connection
        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            self.kafka.brokers = brokers;
        }

        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            self.kafka.client_id = client_id;
        }

        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            self.kafka.security_mut().protocol = protocol;
        }

        if let Ok(mechanism) = std::env::var("KAFKA_SASL_MECHANISM") {
            self.kafka.security_mut().sasl_mechanism = Some(mechanism);
        }

        if let Ok(username) = std::env::var("KAFKA_SASL_USERNAME") {
            self.kafka.security_mut().sasl_username = Some(username);
        }

        if let Ok(password) = std::env::var("KAFKA_SASL_PASSWORD") {
            self.kafka.security_mut().sasl_password = Some(password);
        }

        if let Ok(ca) = std::env::var("KAFKA_SSL_CA_LOCATION") {
            self.kafka.security_mut().ssl_ca_location = Some(ca);
        }

        // Pipeline
        if let Ok(backend) = std::env::var("EVENTS_BROKER") {
            match BrokerBackend::parse(&backend) {
                Some(value) => self.broker = value,
                None => tracing::warn!("Invalid EVENTS_BROKER: {}", backend),
            }
        }

        if let Ok(topic) = std::env::var("EVENTS_TOPIC") {
            self.topic.name = topic;
        }

        if let Some(partitions) = env_parse("EVENTS_TOPIC_PARTITIONS") {
            self.topic.partitions = partitions;
        }

        if let Some(replication) = env_parse("EVENTS_TOPIC_REPLICATION") {
            self.topic.replication_factor = replication;
        }

        if let Ok(group_id) = std::env::var("EVENTS_GROUP_ID") {
            self.consumer.group_id = group_id;
        }

        if let Some(timeout) = env_parse("EVENTS_HANDLER_TIMEOUT_MS") {
            self.consumer.handler_timeout_ms = timeout;
        }

        if let Some(max_attempts) = env_parse("EVENTS_MAX_ATTEMPTS") {
            self.retry.max_attempts = max_attempts;
        }

        if let Some(delay_ms) = env_parse("EVENTS_BACKOFF_MS") {
            self.retry.backoff = BackoffPolicy::Fixed { delay_ms };
        }

        if let Ok(group_id) = std::env::var("EVENTS_DRAIN_GROUP_ID") {
            self.drain.group_id = group_id;
        }

        if let Some(max_records) = env_parse("EVENTS_DRAIN_MAX_RECORDS") {
            self.drain.max_records = max_records;
        }

        if let Some(timeout) = env_parse("EVENTS_DRAIN_TIMEOUT_MS") {
            self.drain.timeout_ms = timeout;
        }

        if let Ok(bind) = std::env::var("EVENTS_HTTP_BIND") {
            self.http.bind = bind;
        }

        if let Ok(level) = std::env::var("EVENTS_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(json) = env_parse("EVENTS_LOG_JSON") {
            self.logging.json_format = json;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }

        if let Some(brokers) = &cli.brokers {
            self.kafka.brokers = brokers.clone();
        }

        if let Some(backend) = &cli.backend {
            match BrokerBackend::parse(backend) {
                Some(value) => self.broker = value,
                None => tracing::warn!("Ignoring unknown --backend value: {}", backend),
            }
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are within acceptable ranges
    /// and that required fields are properly set.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.topic.name.trim().is_empty() {
            return Err(EventsError::Config("topic.name cannot be empty".to_string()).into());
        }

        if self.topic.partitions < 1 {
            return Err(
                EventsError::Config("topic.partitions must be at least 1".to_string()).into(),
            );
        }

        if self.topic.replication_factor < 1 {
            return Err(EventsError::Config(
                "topic.replication_factor must be at least 1".to_string(),
            )
            .into());
        }

        if self.consumer.group_id.trim().is_empty() {
            return Err(
                EventsError::Config("consumer.group_id cannot be empty".to_string()).into(),
            );
        }

        if self.consumer.handler_timeout_ms == 0 {
            return Err(EventsError::Config(
                "consumer.handler_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        self.retry.validate()?;

        if self.drain.group_id.trim().is_empty() {
            return Err(EventsError::Config("drain.group_id cannot be empty".to_string()).into());
        }

        if self.drain.group_id == self.consumer.group_id {
            tracing::warn!(
                group_id = %self.drain.group_id,
                "Drain shares the consumer group; drains will steal partitions from running consumers"
            );
        }

        if self.drain.timeout_ms == 0 {
            return Err(
                EventsError::Config("drain.timeout_ms must be greater than 0".to_string()).into(),
            );
        }

        if self.http.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(EventsError::Config(format!(
                "http.bind is not a socket address: {}",
                self.http.bind
            ))
            .into());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(EventsError::Config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ))
            .into());
        }

        if self.broker == BrokerBackend::Kafka {
            self.kafka.to_settings()?;
        }

        Ok(())
    }

    /// Handler timeout as a duration
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer.handler_timeout_ms)
    }

    /// Redelivery backoff as a duration
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer.redelivery_backoff_ms)
    }

    /// Drain timeout as a duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain.timeout_ms)
    }
}
