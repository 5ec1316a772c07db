//! rdkafka implementations of the broker collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerClientFactory, BrokerConsumer, BrokerProducer, ConsumerSettings, PollEvent,
};
use crate::config::KafkaConfig;
use crate::delivery::CommitPolicy;
use crate::error::BrokerError;
use crate::metrics_consts::KAFKA_COMMIT_CALLBACKS;
use crate::types::{ConsumedRecord, PartitionOffset, TopicName, TopicPartition};

/// Client context shared by the pump's consumer and producer. Revoked partitions
/// are forwarded to the consumer's poll so the loop can drop their ledgers.
#[derive(Default)]
pub struct PumpContext {
    revoked: Option<mpsc::UnboundedSender<Vec<TopicPartition>>>,
}

impl PumpContext {
    fn forwarding_revocations(revoked: mpsc::UnboundedSender<Vec<TopicPartition>>) -> Self {
        Self {
            revoked: Some(revoked),
        }
    }
}

impl ClientContext for PumpContext {}

impl ConsumerContext for PumpContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        if let (Rebalance::Revoke(partitions), Some(revoked)) = (rebalance, &self.revoked) {
            let partitions: Vec<TopicPartition> = partitions
                .elements()
                .iter()
                .map(|element| TopicPartition::new(element.topic(), element.partition()))
                .collect();
            if revoked.send(partitions).is_err() {
                warn!("Consumer is gone, dropping revoked partitions");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                metrics::counter!(KAFKA_COMMIT_CALLBACKS, "outcome" => "success").increment(1);
                debug!(
                    "Successfully committed offsets for {} partitions",
                    offsets.count()
                );
            }
            // Nothing was stored since the last background commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                metrics::counter!(KAFKA_COMMIT_CALLBACKS, "outcome" => "failure").increment(1);
                warn!("Failed to commit offsets: {}", e);
            }
        }
    }
}

/// Consumer configuration with the group defaults the pump runs with. The commit
/// flags always come from a resolved `CommitPolicy`, never from raw settings.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    pub fn with_commit_policy(mut self, policy: &CommitPolicy, auto_commit_interval: Duration) -> Self {
        self.config
            .set("enable.auto.commit", policy.enable_auto_commit.to_string())
            .set(
                "enable.auto.offset.store",
                policy.enable_auto_offset_store.to_string(),
            );
        if policy.enable_auto_commit {
            self.config.set(
                "auto.commit.interval.ms",
                auto_commit_interval.as_millis().to_string(),
            );
        }
        self
    }

    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.partition.eof", enabled.to_string());
        self
    }

    /// earliest or latest
    pub fn with_offset_reset(mut self, offset_reset: &str) -> Self {
        self.config.set("auto.offset.reset", offset_reset);
        self
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Map an rdkafka error onto the pump's fatal/transient split. Fatal errors stop
/// the poll loop; everything else is retried with a backoff.
pub fn classify(operation: &'static str, error: KafkaError) -> BrokerError {
    let code = error
        .rdkafka_error_code()
        .map(|code| format!("{code:?}"))
        .unwrap_or_else(|| "unknown".to_string());

    let fatal = match &error {
        KafkaError::MessageConsumptionFatal(_)
        | KafkaError::Canceled
        | KafkaError::ClientCreation(_)
        | KafkaError::Subscription(_) => true,
        KafkaError::Global(code) => {
            matches!(code, RDKafkaErrorCode::Authentication | RDKafkaErrorCode::Fatal)
        }
        _ => false,
    };

    match fatal {
        true => BrokerError::fatal(operation, code, error.to_string()),
        false => BrokerError::transient(operation, code, error.to_string()),
    }
}

/// Broker offsets name the next record to read, one past the processed one.
fn next_offset_list(position: &PartitionOffset) -> Result<TopicPartitionList, BrokerError> {
    let mut list = TopicPartitionList::new();
    list.add_partition_offset(
        position.topic(),
        position.partition(),
        Offset::Offset(position.offset() + 1),
    )
    .map_err(|e| classify("build offset list", e))?;
    Ok(list)
}

pub struct KafkaConsumer {
    consumer: Option<StreamConsumer<PumpContext>>,
    topic: Option<TopicName>,
    policy: CommitPolicy,
    revoked: mpsc::UnboundedReceiver<Vec<TopicPartition>>,
    /// A record polled in the same call that ran a revocation; handed out after it.
    held_back: Option<ConsumedRecord>,
}

fn closed(operation: &'static str) -> BrokerError {
    BrokerError::fatal(operation, "closed", "the consumer is closed")
}

impl KafkaConsumer {
    fn handle(&self, operation: &'static str) -> Result<&StreamConsumer<PumpContext>, BrokerError> {
        self.consumer.as_ref().ok_or_else(|| closed(operation))
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    fn subscribe(&mut self, topic: &TopicName) -> Result<(), BrokerError> {
        self.handle("subscribe")?
            .subscribe(&[topic.as_str()])
            .map_err(|e| classify("subscribe", e))?;
        self.topic = Some(topic.clone());

        info!(topic = topic.as_str(), "Subscribed consumer");
        Ok(())
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<PollEvent, BrokerError> {
        let consumer = self.consumer.as_ref().ok_or_else(|| closed("poll"))?;

        // Revocations always go out before the records that follow them
        if let Ok(partitions) = self.revoked.try_recv() {
            return Ok(PollEvent::PartitionsRevoked(partitions));
        }
        if let Some(record) = self.held_back.take() {
            return Ok(PollEvent::Record(record));
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(PollEvent::Cancelled),
            result = consumer.recv() => match result {
                Ok(message) => {
                    let record = ConsumedRecord::from_message(&message);
                    match self.revoked.try_recv() {
                        Ok(partitions) => {
                            self.held_back = Some(record);
                            Ok(PollEvent::PartitionsRevoked(partitions))
                        }
                        Err(_) => Ok(PollEvent::Record(record)),
                    }
                }
                Err(KafkaError::PartitionEOF(partition)) => {
                    let topic = self.topic.as_ref().map(TopicName::as_str).unwrap_or_default();
                    Ok(PollEvent::EndOfPartition(TopicPartition::new(topic, partition)))
                }
                Err(e) => Err(classify("poll", e)),
            },
        }
    }

    fn commit(&mut self, position: &PartitionOffset) -> Result<(), BrokerError> {
        let offsets = next_offset_list(position)?;
        self.handle("commit")?
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| classify("commit", e))
    }

    fn store_offset(&mut self, position: &PartitionOffset) -> Result<(), BrokerError> {
        let offsets = next_offset_list(position)?;
        self.handle("store offset")?
            .store_offsets(&offsets)
            .map_err(|e| classify("store offset", e))
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(());
        };

        // Flush whatever the background committer has not picked up yet
        let result = match self.policy.enable_auto_commit {
            true => match consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
                Err(e) => Err(classify("close", e)),
            },
            false => Ok(()),
        };

        consumer.unsubscribe();
        // Dropping the handle leaves the group
        drop(consumer);

        info!(
            topic = self.topic.as_ref().map(TopicName::as_str),
            "Closed consumer"
        );
        result
    }
}

pub struct KafkaProducer {
    producer: FutureProducer<PumpContext>,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn produce(
        &self,
        topic: &TopicName,
        record: &ConsumedRecord,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers().len());
        for header in record.headers() {
            headers = headers.insert(Header {
                key: &header.key,
                value: header.value.as_deref(),
            });
        }

        let future_record = FutureRecord::<[u8], [u8]> {
            topic: topic.as_str(),
            partition: None,
            payload: record.payload().map(|payload| &payload[..]),
            key: record.key().map(|key| &key[..]),
            timestamp: None,
            headers: Some(headers),
        };

        let delivery = self
            .producer
            .send_result(future_record)
            .map_err(|(e, _)| classify("produce", e))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(BrokerError::transient(
                "produce",
                "cancelled",
                "the pump shut down before delivery was confirmed",
            )),
            result = delivery => match result {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((e, _))) => Err(classify("produce", e)),
                Err(_) => Err(BrokerError::transient(
                    "produce",
                    "cancelled",
                    "the delivery future was dropped",
                )),
            },
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BrokerError::transient("flush", "join", e.to_string()))?
            .map_err(|e| classify("flush", e))
    }
}

pub struct KafkaClientFactory {
    config: KafkaConfig,
}

impl KafkaClientFactory {
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }

    fn consumer_config(&self, settings: &ConsumerSettings) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.config.kafka_hosts, &self.config.kafka_consumer_group)
            .with_commit_policy(&settings.policy, settings.auto_commit_interval)
            .with_partition_eof(settings.enable_partition_eof)
            .with_offset_reset(&self.config.kafka_consumer_offset_reset)
            .with_tls(self.config.kafka_tls)
            .build()
    }

    fn producer_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.config.kafka_hosts)
            .set("linger.ms", self.config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                self.config.kafka_compression_codec.to_owned(),
            );

        if self.config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

impl BrokerClientFactory for KafkaClientFactory {
    fn create_consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let client_config = self.consumer_config(settings);
        debug!("rdkafka consumer configuration: {:?}", client_config);

        let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<PumpContext> = client_config
            .create_with_context(PumpContext::forwarding_revocations(revoked_tx))
            .map_err(|e| classify("create consumer", e))?;

        Ok(Box::new(KafkaConsumer {
            consumer: Some(consumer),
            topic: None,
            policy: settings.policy,
            revoked: revoked_rx,
            held_back: None,
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        let client_config = self.producer_config();
        debug!("rdkafka producer configuration: {:?}", client_config);

        let producer: FutureProducer<PumpContext> = client_config
            .create_with_context(PumpContext::default())
            .map_err(|e| classify("create producer", e))?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(e) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", e);
                return Err(classify("fetch metadata", e));
            }
        }

        Ok(Arc::new(KafkaProducer { producer }))
    }
}
