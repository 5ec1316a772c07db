use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use kafka_pump::broker::BrokerClientFactory;
use kafka_pump::error::{BrokerError, ConfigError, ContextError, PumpError};
use kafka_pump::health::{ComponentStatus, HealthHandle, HealthRegistry};
use kafka_pump::test_utils::{
    mock_broker, record, wait_until, BrokerCall, ChannelPipeline, CompletingPipeline,
    ProducedRecord,
};
use kafka_pump::types::TopicName;
use kafka_pump::{
    CommitStrategy, DeliverySemantics, DispatchPipeline, ErrorStrategy, MessageContext,
    PumpOptions, PumpState, TransportPump,
};

const TOPIC: &str = "events";
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn options(semantics: DeliverySemantics) -> PumpOptions {
    PumpOptions {
        auto_commit_interval: Duration::from_millis(10),
        ..PumpOptions::new(TopicName::parse(TOPIC).unwrap(), semantics)
    }
}

/// At-least-once with synchronous per-message commits, so every advance shows up
/// as a commit call.
fn per_message_at_least_once() -> PumpOptions {
    PumpOptions {
        enable_auto_commit: Some(false),
        ..options(DeliverySemantics::AtLeastOnce)
    }
}

fn pump(
    options: PumpOptions,
    factory: Arc<dyn BrokerClientFactory>,
    pipeline: Arc<dyn DispatchPipeline>,
) -> TransportPump {
    TransportPump::new(options, factory, pipeline).unwrap()
}

async fn next_message(messages: &mut UnboundedReceiver<MessageContext>) -> MessageContext {
    tokio::time::timeout(Duration::from_secs(5), messages.recv())
        .await
        .expect("no message dispatched within 5s")
        .expect("pipeline dropped")
}

async fn collect_messages(
    messages: &mut UnboundedReceiver<MessageContext>,
    count: usize,
) -> HashMap<i64, MessageContext> {
    let mut collected = HashMap::new();
    for _ in 0..count {
        let message = next_message(messages).await;
        collected.insert(message.offset(), message);
    }
    collected
}

#[tokio::test]
async fn commits_only_the_contiguous_processed_prefix() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    for offset in 1..=3 {
        script.record(record(TOPIC, 0, offset));
    }
    let dispatched = collect_messages(&mut messages, 3).await;

    dispatched[&2].complete().await.unwrap();
    dispatched[&3].complete().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.commits().is_empty());

    dispatched[&1].complete().await.unwrap();
    wait_until(|| log.commits() == vec![3]).await;

    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(log.commits(), vec![3]);
    assert!(log.closed());
    assert_eq!(pump.state(), PumpState::Stopped);
}

#[tokio::test]
async fn partitions_advance_independently() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 10));
    script.record(record(TOPIC, 1, 20));
    let dispatched = collect_messages(&mut messages, 2).await;

    dispatched[&20].complete().await.unwrap();
    wait_until(|| log.commits() == vec![20]).await;
    dispatched[&10].complete().await.unwrap();
    wait_until(|| log.commits() == vec![20, 10]).await;

    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn at_least_once_defaults_to_stored_offsets() {
    let (factory, script, log) = mock_broker();
    let pipeline = Arc::new(CompletingPipeline::default());
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory.clone(),
        pipeline.clone(),
    );
    assert_eq!(pump.policy().strategy(), CommitStrategy::Batch);
    pump.start_pump().await.unwrap();

    let settings = factory.consumer_settings().unwrap();
    assert!(settings.policy.enable_auto_commit);
    assert!(!settings.policy.enable_auto_offset_store);

    for offset in 0..3 {
        script.record(record(TOPIC, 0, offset));
    }
    wait_until(|| pipeline.completed().len() == 3).await;
    wait_until(|| log.stored().last() == Some(&2)).await;

    pump.stop_pump(STOP_TIMEOUT).await;
    assert!(log.commits().is_empty());
    assert!(log.closed());
}

#[tokio::test]
async fn at_most_once_commits_before_dispatch() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(options(DeliverySemantics::AtMostOnce), factory, pipeline);
    assert_eq!(pump.policy().strategy(), CommitStrategy::PerMessage);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 7));
    let message = next_message(&mut messages).await;
    assert_eq!(log.commits(), vec![7]);

    message.complete().await.unwrap();
    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(log.commits(), vec![7]);
}

#[tokio::test]
async fn at_most_once_abandon_does_not_commit_again() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(options(DeliverySemantics::AtMostOnce), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    next_message(&mut messages).await.abandon().await.unwrap();

    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(log.commits(), vec![1]);
}

#[tokio::test]
async fn invalid_commit_configuration_is_rejected() {
    let (factory, _script, _log) = mock_broker();
    let options = PumpOptions {
        enable_auto_commit: Some(true),
        enable_auto_offset_store: Some(true),
        ..options(DeliverySemantics::AtLeastOnce)
    };

    let result = TransportPump::new(options, factory, Arc::new(CompletingPipeline::default()));
    assert!(matches!(
        result,
        Err(ConfigError::InvalidCommitConfiguration {
            semantics: DeliverySemantics::AtLeastOnce,
            auto_commit: Some(true),
            auto_offset_store: Some(true),
        })
    ));
}

#[tokio::test]
async fn stop_is_idempotent_and_start_runs_once() {
    let (factory, _script, log) = mock_broker();
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory,
        Arc::new(CompletingPipeline::default()),
    );
    assert_eq!(pump.state(), PumpState::Created);

    pump.start_pump().await.unwrap();
    assert_eq!(pump.state(), PumpState::Running);
    assert!(matches!(
        pump.start_pump().await,
        Err(PumpError::AlreadyStarted)
    ));

    pump.stop_pump(STOP_TIMEOUT).await;
    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(pump.state(), PumpState::Stopped);
    assert_eq!(
        log.calls(),
        vec![BrokerCall::Subscribe(TOPIC.to_string()), BrokerCall::Close]
    );

    assert!(matches!(
        pump.start_pump().await,
        Err(PumpError::AlreadyStopped)
    ));
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let (factory, _script, log) = mock_broker();
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory,
        Arc::new(CompletingPipeline::default()),
    );

    pump.stop_pump(STOP_TIMEOUT).await;
    pump.stop_pump(STOP_TIMEOUT).await;

    assert_eq!(pump.state(), PumpState::Stopped);
    assert!(log.calls().is_empty());
}

#[tokio::test]
async fn end_of_partition_markers_are_skipped() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(
        PumpOptions {
            enable_partition_eof: true,
            ..per_message_at_least_once()
        },
        factory,
        pipeline,
    );
    pump.start_pump().await.unwrap();

    script.end_of_partition(TOPIC, 0);
    script.record(record(TOPIC, 0, 4));

    let message = next_message(&mut messages).await;
    assert_eq!(message.offset(), 4);
    message.complete().await.unwrap();
    wait_until(|| log.commits() == vec![4]).await;

    pump.stop_pump(STOP_TIMEOUT).await;
    assert!(messages.try_recv().is_err());
}

#[tokio::test]
async fn transient_poll_errors_are_retried() {
    let (factory, script, _log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.error(BrokerError::transient(
        "poll",
        "AllBrokersDown",
        "all brokers down",
    ));
    script.record(record(TOPIC, 0, 1));

    let message = next_message(&mut messages).await;
    assert_eq!(pump.state(), PumpState::Running);

    message.complete().await.unwrap();
    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn fatal_poll_error_faults_the_pump() {
    let (factory, script, log) = mock_broker();
    let liveness = HealthRegistry::new("liveness");
    let handle = liveness.register("pump".to_string(), Duration::from_secs(30));
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory,
        Arc::new(CompletingPipeline::default()),
    )
    .with_liveness(handle);
    pump.start_pump().await.unwrap();

    script.error(BrokerError::fatal(
        "poll",
        "Authentication",
        "authentication failed",
    ));

    let mut state = pump.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == PumpState::Faulted),
    )
    .await
    .unwrap()
    .unwrap();

    let status = liveness.get_status();
    assert!(!status.healthy);
    assert!(matches!(
        status.components.get("pump"),
        Some(ComponentStatus::Unhealthy(_))
    ));

    pump.stop_pump(STOP_TIMEOUT).await;
    assert!(log.closed());
    assert_eq!(pump.state(), PumpState::Stopped);
}

#[tokio::test]
async fn offsets_going_backwards_fault_the_pump() {
    let (factory, script, _log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 5));
    script.record(record(TOPIC, 0, 3));

    let mut state = pump.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state == PumpState::Faulted),
    )
    .await
    .unwrap()
    .unwrap();

    let message = next_message(&mut messages).await;
    assert_eq!(message.offset(), 5);
    message.complete().await.unwrap();
    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn completions_after_polling_stops_are_committed() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = Arc::new(pump(per_message_at_least_once(), factory, pipeline));
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    let message = next_message(&mut messages).await;

    let stopping = tokio::spawn({
        let pump = pump.clone();
        async move { pump.stop_pump(STOP_TIMEOUT).await }
    });
    wait_until(|| pump.state() == PumpState::Stopping).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!log.closed());

    message.complete().await.unwrap();
    stopping.await.unwrap();

    assert_eq!(log.commits(), vec![1]);
    assert_eq!(
        log.calls().last(),
        Some(&BrokerCall::Close),
        "commit must land before the consumer closes"
    );
}

#[tokio::test]
async fn drain_timeout_still_closes_the_consumer() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    let stuck = next_message(&mut messages).await;

    pump.stop_pump(Duration::from_millis(50)).await;
    assert!(log.closed());
    assert_eq!(pump.state(), PumpState::Stopped);

    // Finishing late is harmless but nothing is committed any more
    stuck.complete().await.unwrap();
    assert!(log.commits().is_empty());
}

#[tokio::test]
async fn in_flight_limit_holds_back_polling() {
    let (factory, script, _log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(
        PumpOptions {
            max_in_flight: 1,
            ..per_message_at_least_once()
        },
        factory,
        pipeline,
    );
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    script.record(record(TOPIC, 0, 2));

    let first = next_message(&mut messages).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(messages.try_recv().is_err());

    first.complete().await.unwrap();
    let second = next_message(&mut messages).await;
    assert_eq!(second.offset(), 2);

    second.complete().await.unwrap();
    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn abandoned_records_go_to_the_dead_letter_topic() {
    let (factory, script, log) = mock_broker();
    let producer = factory.producer();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(
        PumpOptions {
            error_strategy: ErrorStrategy::DeadLetter,
            dead_letter_topic: Some(TopicName::parse("events_dlq").unwrap()),
            ..per_message_at_least_once()
        },
        factory,
        pipeline,
    );
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    script.record(record(TOPIC, 0, 2));
    let dispatched = collect_messages(&mut messages, 2).await;

    dispatched[&1].abandon().await.unwrap();
    wait_until(|| log.commits() == vec![1]).await;
    dispatched[&2].complete().await.unwrap();
    wait_until(|| log.commits() == vec![1, 2]).await;

    assert_eq!(
        producer.produced(),
        vec![ProducedRecord {
            topic: "events_dlq".to_string(),
            offset: 1,
            payload: Some("payload-1".into()),
        }]
    );

    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(producer.flushes(), 1);
}

#[tokio::test]
async fn failed_dead_letter_publish_can_be_retried() {
    let (factory, script, log) = mock_broker();
    let producer = factory.producer();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(
        PumpOptions {
            error_strategy: ErrorStrategy::DeadLetter,
            dead_letter_topic: Some(TopicName::parse("events_dlq").unwrap()),
            ..per_message_at_least_once()
        },
        factory,
        pipeline,
    );
    pump.start_pump().await.unwrap();

    for offset in 1..=20 {
        script.record(record(TOPIC, 0, offset));
    }
    let dispatched = collect_messages(&mut messages, 20).await;

    producer.fail_next_produce();
    assert!(matches!(
        dispatched[&1].abandon().await,
        Err(ContextError::DeadLetter(_))
    ));

    // Later completions wait behind the record that failed to redirect
    for offset in 2..=20 {
        dispatched[&offset].complete().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.commits().is_empty());

    // Retrying the abandon releases the whole prefix
    dispatched[&1].abandon().await.unwrap();
    wait_until(|| log.commits() == vec![20]).await;
    assert_eq!(producer.produced().len(), 1);
    assert_eq!(pump.state(), PumpState::Running);

    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(log.commits(), vec![20]);
}

#[tokio::test]
async fn double_completion_is_rejected() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    let message = next_message(&mut messages).await;

    message.complete().await.unwrap();
    assert!(matches!(
        message.abandon().await,
        Err(ContextError::AlreadyFinalized(_))
    ));

    wait_until(|| log.commits() == vec![1]).await;
    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(log.commits(), vec![1]);
}

#[tokio::test]
async fn message_id_comes_from_the_header() {
    let (factory, script, _log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1).with_header("message-id", Some("abc-123".into())));
    script.record(record(TOPIC, 0, 2));

    let dispatched = collect_messages(&mut messages, 2).await;
    assert_eq!(dispatched[&1].message_id(), "abc-123");
    assert!(!dispatched[&2].message_id().is_empty());
    assert_eq!(dispatched[&2].body(), "payload-2");

    for message in dispatched.values() {
        message.complete().await.unwrap();
    }
    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn dropping_a_running_pump_closes_the_consumer() {
    let (factory, _script, log) = mock_broker();
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory,
        Arc::new(CompletingPipeline::default()),
    );
    pump.start_pump().await.unwrap();

    drop(pump);
    wait_until(|| log.closed()).await;
}

/// Liveness with a deadline short enough for a test to outlive it.
fn short_liveness() -> (HealthRegistry, HealthHandle) {
    let liveness = HealthRegistry::new("liveness");
    let handle = liveness.register("pump".to_string(), Duration::from_millis(100));
    (liveness, handle)
}

#[tokio::test]
async fn idle_topic_stays_healthy() {
    let (factory, _script, _log) = mock_broker();
    let (liveness, handle) = short_liveness();
    let pump = pump(
        options(DeliverySemantics::AtLeastOnce),
        factory,
        Arc::new(CompletingPipeline::default()),
    )
    .with_liveness(handle);
    pump.start_pump().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = liveness.get_status();
    assert!(status.healthy, "{:?}", status.components);
    assert_eq!(pump.state(), PumpState::Running);

    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn waiting_for_an_in_flight_slot_stays_healthy() {
    let (factory, script, _log) = mock_broker();
    let (liveness, handle) = short_liveness();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(
        PumpOptions {
            max_in_flight: 1,
            ..per_message_at_least_once()
        },
        factory,
        pipeline,
    )
    .with_liveness(handle);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    script.record(record(TOPIC, 0, 2));
    let first = next_message(&mut messages).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = liveness.get_status();
    assert!(status.healthy, "{:?}", status.components);

    first.complete().await.unwrap();
    next_message(&mut messages).await.complete().await.unwrap();
    pump.stop_pump(STOP_TIMEOUT).await;
}

#[tokio::test]
async fn redelivery_after_revocation_restarts_the_ledger() {
    let (factory, script, log) = mock_broker();
    let (pipeline, mut messages) = ChannelPipeline::channel();
    let pump = pump(per_message_at_least_once(), factory, pipeline);
    pump.start_pump().await.unwrap();

    script.record(record(TOPIC, 0, 1));
    script.record(record(TOPIC, 0, 2));
    let before = collect_messages(&mut messages, 2).await;

    // Revoked then reassigned: the broker resumes from the last commit
    script.revoke(TOPIC, &[0]);
    script.record(record(TOPIC, 0, 1));
    script.record(record(TOPIC, 0, 2));
    let after = collect_messages(&mut messages, 2).await;
    assert_eq!(pump.state(), PumpState::Running);

    // Finishing the copies from before the revocation commits nothing
    before[&1].complete().await.unwrap();
    before[&2].complete().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.commits().is_empty());

    after[&2].complete().await.unwrap();
    after[&1].complete().await.unwrap();
    wait_until(|| log.commits() == vec![2]).await;

    pump.stop_pump(STOP_TIMEOUT).await;
    assert_eq!(pump.state(), PumpState::Stopped);
}
