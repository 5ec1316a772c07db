use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::delivery::DeliverySemantics;
use crate::error::ConfigError;
use crate::transport::{ErrorStrategy, PumpOptions};
use crate::types::TopicName;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    // Pretty logs instead of JSON
    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "at_least_once")]
    pub delivery_semantics: DeliverySemantics,

    #[envconfig(default = "skip")]
    pub error_strategy: ErrorStrategy, // skip, dead_letter

    pub kafka_dead_letter_topic: Option<String>,

    // Left unset, the commit flags follow from the delivery semantics
    pub kafka_consumer_auto_commit: Option<bool>,
    pub kafka_consumer_auto_offset_store: Option<bool>,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub kafka_enable_partition_eof: bool,

    #[envconfig(default = "1024")]
    pub max_in_flight_messages: usize,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "kafka-pump")]
    pub kafka_consumer_group: String,

    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pump options for this process. Topic names are checked here; the commit flags
    /// and the error strategy are checked when the pump is built.
    pub fn to_pump_options(&self) -> Result<PumpOptions, ConfigError> {
        let topic = TopicName::parse(&self.kafka.kafka_consumer_topic)?;
        let dead_letter_topic = self
            .kafka_dead_letter_topic
            .as_deref()
            .filter(|topic| !topic.is_empty())
            .map(TopicName::parse)
            .transpose()?;

        Ok(PumpOptions {
            enable_auto_commit: self.kafka_consumer_auto_commit,
            enable_auto_offset_store: self.kafka_consumer_auto_offset_store,
            auto_commit_interval: self.kafka_consumer_auto_commit_interval_ms.0,
            error_strategy: self.error_strategy,
            dead_letter_topic,
            enable_partition_eof: self.kafka_enable_partition_eof,
            max_in_flight: self.max_in_flight_messages,
            shutdown_timeout: self.shutdown_timeout_ms.0,
            ..PumpOptions::new(topic, self.delivery_semantics)
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
