//! Collaborator interfaces for the broker client. The pump only talks to the
//! broker through these traits; `kafka` provides the rdkafka implementations and
//! `test_utils` a scripted in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::delivery::CommitPolicy;
use crate::error::BrokerError;
use crate::types::{ConsumedRecord, PartitionOffset, TopicName, TopicPartition};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Record(ConsumedRecord),
    /// The consumer caught up with the end of a partition.
    EndOfPartition(TopicPartition),
    /// The group took these partitions away. Records polled afterwards for a
    /// reassigned partition restart from its committed position.
    PartitionsRevoked(Vec<TopicPartition>),
    /// The cancellation token fired while waiting.
    Cancelled,
}

/// A consumer handle. Implementations are not expected to be safe for concurrent
/// use: the pump calls every method from a single task.
#[async_trait]
pub trait BrokerConsumer: Send + 'static {
    fn subscribe(&mut self, topic: &TopicName) -> Result<(), BrokerError>;

    /// Wait for the next event. Must return `PollEvent::Cancelled` promptly once
    /// `cancel` fires.
    async fn poll(&mut self, cancel: &CancellationToken) -> Result<PollEvent, BrokerError>;

    /// Synchronously commit the position of a processed record.
    fn commit(&mut self, position: &PartitionOffset) -> Result<(), BrokerError>;

    /// Store the position of a processed record for the next background commit.
    fn store_offset(&mut self, position: &PartitionOffset) -> Result<(), BrokerError>;

    /// Leave the group and release the handle. Further calls are no-ops.
    fn close(&mut self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync + 'static {
    /// Publish a copy of `record` (key, payload, headers) to `topic`.
    async fn produce(
        &self,
        topic: &TopicName,
        record: &ConsumedRecord,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError>;

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Consumer settings owned by the pump rather than the broker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub policy: CommitPolicy,
    pub auto_commit_interval: Duration,
    pub enable_partition_eof: bool,
}

/// Builds the broker handles for one pump run.
pub trait BrokerClientFactory: Send + Sync + 'static {
    fn create_consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError>;
}
