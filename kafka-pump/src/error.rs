use thiserror::Error;

use crate::delivery::DeliverySemantics;
use crate::receive_context::ContextState;
use crate::types::TopicPartition;

/// Errors raised while building a pump. A pump with an invalid configuration never starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0:?} is not a valid topic name: expected 1-255 characters of [a-zA-Z0-9._-]")]
    InvalidTopicName(String),
    #[error(
        "invalid commit configuration: semantics={semantics}, enable.auto.commit={auto_commit:?}, enable.auto.offset.store={auto_offset_store:?}"
    )]
    InvalidCommitConfiguration {
        semantics: DeliverySemantics,
        auto_commit: Option<bool>,
        auto_offset_store: Option<bool>,
    },
    #[error("the dead letter error strategy requires a dead letter topic")]
    MissingDeadLetterTopic,
    #[error("max in flight messages must be greater than zero")]
    ZeroMaxInFlight,
}

/// A failure reported by a broker collaborator.
#[derive(Error, Debug, Clone)]
#[error("{operation} failed: {message}")]
pub struct BrokerError {
    pub operation: &'static str,
    pub code: String,
    pub message: String,
    fatal: bool,
}

impl BrokerError {
    pub fn transient(operation: &'static str, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: code.into(),
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(operation: &'static str, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation,
            code: code.into(),
            message: message.into(),
            fatal: true,
        }
    }

    /// Fatal errors mean the broker connection cannot be recovered by retrying.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("offset {offset} received on {partition} after offset {last_received}")]
    OutOfOrderOffset {
        partition: TopicPartition,
        offset: i64,
        last_received: i64,
    },
    #[error("ledger for {expected} was handed a record from {actual}")]
    PartitionMismatch {
        expected: TopicPartition,
        actual: TopicPartition,
    },
}

/// Errors surfaced to the dispatch pipeline from `complete` / `abandon`.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("receive context was already finalized as {0:?}")]
    AlreadyFinalized(ContextState),
    #[error("failed to publish to the dead letter topic")]
    DeadLetter(#[source] BrokerError),
    #[error("failed to advance the offset ledger")]
    Tracker(#[from] TrackerError),
}

#[derive(Error, Debug)]
pub enum PumpError {
    #[error("invalid pump configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("broker client error: {0}")]
    Broker(#[from] BrokerError),
    #[error("offset tracking error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("pump was already started")]
    AlreadyStarted,
    #[error("pump was stopped and cannot be restarted")]
    AlreadyStopped,
}
