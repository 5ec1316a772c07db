//! Scripted in-memory broker and pipelines for driving the pump in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{
    BrokerClientFactory, BrokerConsumer, BrokerProducer, ConsumerSettings, PollEvent,
};
use crate::error::BrokerError;
use crate::pipeline::{DispatchPipeline, MessageContext};
use crate::types::{ConsumedRecord, PartitionOffset, TopicName, TopicPartition};

pub fn record(topic: &str, partition: i32, offset: i64) -> ConsumedRecord {
    ConsumedRecord::new(TopicPartition::new(topic, partition), offset)
        .with_payload(format!("payload-{offset}"))
}

/// Poll until `condition` holds, panicking after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Subscribe(String),
    Commit(PartitionOffset),
    StoreOffset(PartitionOffset),
    Close,
}

/// Every call the pump made on the consumer, in order.
#[derive(Clone, Default)]
pub struct BrokerLog {
    calls: Arc<Mutex<Vec<BrokerCall>>>,
}

impl BrokerLog {
    fn push(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Offsets passed to synchronous commits.
    pub fn commits(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Commit(position) => Some(position.offset()),
                _ => None,
            })
            .collect()
    }

    /// Offsets stored for the background committer.
    pub fn stored(&self) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::StoreOffset(position) => Some(position.offset()),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> bool {
        self.calls().contains(&BrokerCall::Close)
    }
}

/// Feeds poll results to a `MockConsumer`.
#[derive(Clone)]
pub struct BrokerScript {
    events: mpsc::UnboundedSender<Result<PollEvent, BrokerError>>,
}

impl BrokerScript {
    pub fn record(&self, record: ConsumedRecord) {
        self.send(Ok(PollEvent::Record(record)));
    }

    pub fn end_of_partition(&self, topic: &str, partition: i32) {
        self.send(Ok(PollEvent::EndOfPartition(TopicPartition::new(
            topic, partition,
        ))));
    }

    /// Take partitions away as a group rebalance would.
    pub fn revoke(&self, topic: &str, partitions: &[i32]) {
        self.send(Ok(PollEvent::PartitionsRevoked(
            partitions
                .iter()
                .map(|partition| TopicPartition::new(topic, *partition))
                .collect(),
        )));
    }

    pub fn error(&self, error: BrokerError) {
        self.send(Err(error));
    }

    fn send(&self, event: Result<PollEvent, BrokerError>) {
        self.events.send(event).expect("mock consumer was dropped");
    }
}

pub struct MockConsumer {
    events: mpsc::UnboundedReceiver<Result<PollEvent, BrokerError>>,
    log: BrokerLog,
    closed: bool,
}

impl MockConsumer {
    fn check_open(&self, operation: &'static str) -> Result<(), BrokerError> {
        match self.closed {
            true => Err(BrokerError::fatal(operation, "closed", "the consumer is closed")),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerConsumer for MockConsumer {
    fn subscribe(&mut self, topic: &TopicName) -> Result<(), BrokerError> {
        self.check_open("subscribe")?;
        self.log.push(BrokerCall::Subscribe(topic.as_str().to_string()));
        Ok(())
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<PollEvent, BrokerError> {
        self.check_open("poll")?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(PollEvent::Cancelled),
            event = self.events.recv() => match event {
                Some(event) => event,
                // Script dropped: idle until cancelled like a quiet topic
                None => {
                    cancel.cancelled().await;
                    Ok(PollEvent::Cancelled)
                }
            },
        }
    }

    fn commit(&mut self, position: &PartitionOffset) -> Result<(), BrokerError> {
        self.check_open("commit")?;
        self.log.push(BrokerCall::Commit(position.clone()));
        Ok(())
    }

    fn store_offset(&mut self, position: &PartitionOffset) -> Result<(), BrokerError> {
        self.check_open("store offset")?;
        self.log.push(BrokerCall::StoreOffset(position.clone()));
        Ok(())
    }

    fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.log.push(BrokerCall::Close);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub offset: i64,
    pub payload: Option<Bytes>,
}

#[derive(Clone, Default)]
pub struct MockProducer {
    produced: Arc<Mutex<Vec<ProducedRecord>>>,
    fail_next: Arc<AtomicBool>,
    flushes: Arc<AtomicUsize>,
}

impl MockProducer {
    pub fn produced(&self) -> Vec<ProducedRecord> {
        self.produced.lock().unwrap().clone()
    }

    pub fn fail_next_produce(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerProducer for MockProducer {
    async fn produce(
        &self,
        topic: &TopicName,
        record: &ConsumedRecord,
        _cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::transient(
                "produce",
                "MessageTimedOut",
                "message timed out",
            ));
        }

        self.produced.lock().unwrap().push(ProducedRecord {
            topic: topic.as_str().to_string(),
            offset: record.offset(),
            payload: record.payload().cloned(),
        });
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one scripted consumer and a shared mock producer.
pub struct MockFactory {
    consumer: Mutex<Option<MockConsumer>>,
    producer: MockProducer,
    settings: Mutex<Option<ConsumerSettings>>,
}

impl MockFactory {
    pub fn producer(&self) -> MockProducer {
        self.producer.clone()
    }

    /// Settings the pump asked for when it created its consumer.
    pub fn consumer_settings(&self) -> Option<ConsumerSettings> {
        *self.settings.lock().unwrap()
    }
}

impl BrokerClientFactory for MockFactory {
    fn create_consumer(
        &self,
        settings: &ConsumerSettings,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        *self.settings.lock().unwrap() = Some(*settings);
        match self.consumer.lock().unwrap().take() {
            Some(consumer) => Ok(Box::new(consumer)),
            None => Err(BrokerError::fatal(
                "create consumer",
                "exhausted",
                "the mock consumer was already handed out",
            )),
        }
    }

    fn create_producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        Ok(Arc::new(self.producer.clone()))
    }
}

pub fn mock_broker() -> (Arc<MockFactory>, BrokerScript, BrokerLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = BrokerLog::default();
    let consumer = MockConsumer {
        events: rx,
        log: log.clone(),
        closed: false,
    };

    let factory = Arc::new(MockFactory {
        consumer: Mutex::new(Some(consumer)),
        producer: MockProducer::default(),
        settings: Mutex::new(None),
    });
    (factory, BrokerScript { events: tx }, log)
}

/// Forwards every dispatched message to the test, which decides when and how
/// to finish it.
pub struct ChannelPipeline {
    messages: mpsc::UnboundedSender<MessageContext>,
}

impl ChannelPipeline {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<MessageContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { messages: tx }), rx)
    }
}

#[async_trait]
impl DispatchPipeline for ChannelPipeline {
    async fn dispatch(&self, message: MessageContext) -> anyhow::Result<()> {
        self.messages
            .send(message)
            .map_err(|_| anyhow::anyhow!("test dropped the message receiver"))
    }
}

/// Completes every message as soon as it is dispatched.
#[derive(Default)]
pub struct CompletingPipeline {
    completed: Mutex<Vec<i64>>,
}

impl CompletingPipeline {
    pub fn completed(&self) -> Vec<i64> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DispatchPipeline for CompletingPipeline {
    async fn dispatch(&self, message: MessageContext) -> anyhow::Result<()> {
        message.complete().await?;
        self.completed.lock().unwrap().push(message.offset());
        Ok(())
    }
}
