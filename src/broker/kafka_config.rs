//! Kafka client settings.
//!
//! Connection, authentication and timeout settings shared by the admin
//! client, the producer and the consumers, rendered into rdkafka
//! `ClientConfig` values.
//!
//! # Example
//!
//! ```rust
//! use kafka_events::broker::KafkaSettings;
//!
//! let settings = KafkaSettings::new("localhost:9092")
//!     .with_client_id("kafka-events")
//!     .with_auto_offset_reset("latest");
//! assert!(settings.validate().is_ok());
//! ```

use rdkafka::config::ClientConfig;
use std::time::Duration;
use thiserror::Error;

/// Rejected Kafka settings.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Missing Kafka setting: {0}")]
    Missing(String),

    #[error("Unknown security protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown SASL mechanism: {0}")]
    UnknownMechanism(String),
}

/// `security.protocol` values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    /// Parses a protocol name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownProtocol` for unknown names.
    pub fn parse(value: &str) -> Result<Self, SettingsError> {
        match value.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(SettingsError::UnknownProtocol(value.to_string())),
        }
    }

    /// Whether the protocol authenticates with SASL.
    pub fn uses_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// `sasl.mechanism` values. SCRAM-SHA-256 unless configured otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    #[default]
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// Parses a mechanism name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::UnknownMechanism` for unknown names.
    pub fn parse(value: &str) -> Result<Self, SettingsError> {
        match value.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(SettingsError::UnknownMechanism(value.to_string())),
        }
    }
}

/// SASL credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

/// TLS file locations. Certificate and key are only needed for mutual TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
}

/// Connection settings for every Kafka client the pipeline creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaSettings {
    /// Bootstrap servers, comma-separated.
    pub brokers: String,

    /// Client id prefix reported to the brokers.
    pub client_id: String,

    pub security_protocol: SecurityProtocol,

    /// Required when `security_protocol` uses SASL.
    pub sasl_config: Option<SaslConfig>,

    pub ssl_config: Option<SslConfig>,

    /// Where a group without stored offsets starts ("earliest" or "latest").
    pub auto_offset_reset: String,

    /// Consumer group session timeout.
    pub session_timeout: Duration,

    /// Bound on admin operations, metadata requests and producer delivery.
    pub request_timeout: Duration,
}

impl KafkaSettings {
    /// Creates settings with defaults: plaintext, earliest offset reset,
    /// 30 s session timeout, 10 s request timeout.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kafka_events::broker::KafkaSettings;
    ///
    /// let settings = KafkaSettings::new("localhost:9092");
    /// assert_eq!(settings.auto_offset_reset, "earliest");
    /// ```
    pub fn new(brokers: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            client_id: "kafka-events".to_string(),
            security_protocol: SecurityProtocol::default(),
            sasl_config: None,
            ssl_config: None,
            auto_offset_reset: "earliest".to_string(),
            session_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the client id prefix.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    pub fn with_auto_offset_reset(mut self, policy: &str) -> Self {
        self.auto_offset_reset = policy.to_string();
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Checks that SASL protocols carry credentials.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Missing` when a SASL protocol is selected
    /// without SASL credentials.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.brokers.trim().is_empty() {
            return Err(SettingsError::Missing("kafka.brokers".to_string()));
        }
        if self.security_protocol.uses_sasl() && self.sasl_config.is_none() {
            return Err(SettingsError::Missing(
                "kafka.security.sasl_username / sasl_password".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings common to every client, as key-value pairs.
    pub fn common_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(sasl) = &self.sasl_config {
            settings.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            settings.push(("sasl.username".to_string(), sasl.username.clone()));
            settings.push(("sasl.password".to_string(), sasl.password.clone()));
        }

        if let Some(ssl) = &self.ssl_config {
            if let Some(ca) = &ssl.ca_location {
                settings.push(("ssl.ca.location".to_string(), ca.clone()));
            }
            if let Some(cert) = &ssl.certificate_location {
                settings.push(("ssl.certificate.location".to_string(), cert.clone()));
            }
            if let Some(key) = &ssl.key_location {
                settings.push(("ssl.key.location".to_string(), key.clone()));
            }
        }

        settings
    }

    /// Settings for the admin client.
    pub fn admin_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.push(("client.id".to_string(), format!("{}-admin", self.client_id)));
        settings
    }

    /// Settings for the producer: full acknowledgement, idempotent writes.
    pub fn producer_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.extend([
            ("client.id".to_string(), format!("{}-producer", self.client_id)),
            ("acks".to_string(), "all".to_string()),
            ("enable.idempotence".to_string(), "true".to_string()),
            (
                "message.timeout.ms".to_string(),
                self.request_timeout.as_millis().to_string(),
            ),
        ]);
        settings
    }

    /// Settings for a group consumer.
    ///
    /// Offsets are auto-committed, but only positions explicitly stored
    /// after processing are committed.
    pub fn consumer_settings(&self, group_id: &str) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.extend([
            ("client.id".to_string(), format!("{}-consumer", self.client_id)),
            ("group.id".to_string(), group_id.to_string()),
            (
                "auto.offset.reset".to_string(),
                self.auto_offset_reset.clone(),
            ),
            ("enable.auto.commit".to_string(), "true".to_string()),
            ("enable.auto.offset.store".to_string(), "false".to_string()),
            (
                "session.timeout.ms".to_string(),
                self.session_timeout.as_millis().to_string(),
            ),
        ]);
        settings
    }
}

/// Renders key-value settings into an rdkafka `ClientConfig`.
pub fn client_config(settings: &[(String, String)]) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}
