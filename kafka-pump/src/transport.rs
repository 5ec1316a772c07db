use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClientFactory, BrokerProducer, ConsumerSettings};
use crate::delivery::{resolve, CommitPolicy, DeliverySemantics};
use crate::drain::DrainCoordinator;
use crate::error::{ConfigError, PumpError};
use crate::health::HealthHandle;
use crate::metrics_consts::PUMP_DRAINS;
use crate::offset_tracker::{commit_channel, OffsetTracker};
use crate::pipeline::DispatchPipeline;
use crate::pump::{heartbeat, LoopSignals, PumpLoop};
use crate::receive_context::{ContextShared, DeadLetter};
use crate::types::TopicName;

/// What happens to a record its handler abandons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStrategy {
    /// Log it and move on.
    Skip,
    /// Republish it to the dead letter topic, then move on.
    DeadLetter,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseErrorStrategyError(String);

impl fmt::Display for ParseErrorStrategyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} is not an error strategy, expected skip or dead_letter",
            self.0
        )
    }
}

impl std::error::Error for ParseErrorStrategyError {}

impl FromStr for ErrorStrategy {
    type Err = ParseErrorStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "skip" => Ok(ErrorStrategy::Skip),
            "dead_letter" | "deadletter" => Ok(ErrorStrategy::DeadLetter),
            _ => Err(ParseErrorStrategyError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Created,
    Running,
    Stopping,
    Stopped,
    /// The poll loop hit a fatal broker error. Stop still has to be called to
    /// drain and close.
    Faulted,
}

#[derive(Debug, Clone)]
pub struct PumpOptions {
    pub topic: TopicName,
    pub semantics: DeliverySemantics,
    pub enable_auto_commit: Option<bool>,
    pub enable_auto_offset_store: Option<bool>,
    /// How long stop waits for a final background commit when auto commit is on.
    pub auto_commit_interval: Duration,
    pub error_strategy: ErrorStrategy,
    pub dead_letter_topic: Option<TopicName>,
    pub enable_partition_eof: bool,
    /// Records dispatched but not yet completed or abandoned.
    pub max_in_flight: usize,
    pub shutdown_timeout: Duration,
}

impl PumpOptions {
    pub fn new(topic: TopicName, semantics: DeliverySemantics) -> Self {
        Self {
            topic,
            semantics,
            enable_auto_commit: None,
            enable_auto_offset_store: None,
            auto_commit_interval: Duration::from_secs(5),
            error_strategy: ErrorStrategy::Skip,
            dead_letter_topic: None,
            enable_partition_eof: false,
            max_in_flight: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Check the options and resolve the commit policy they imply.
    pub fn validate(&self) -> Result<CommitPolicy, ConfigError> {
        let policy = resolve(
            self.semantics,
            self.enable_auto_commit,
            self.enable_auto_offset_store,
        )?;

        if self.error_strategy == ErrorStrategy::DeadLetter && self.dead_letter_topic.is_none() {
            return Err(ConfigError::MissingDeadLetterTopic);
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::ZeroMaxInFlight);
        }

        Ok(policy)
    }
}

struct RunningPump {
    poll: CancellationToken,
    teardown: CancellationToken,
    poll_exited: oneshot::Receiver<()>,
    task: JoinHandle<()>,
    drain: Arc<DrainCoordinator>,
    dead_letter: Option<Arc<dyn BrokerProducer>>,
}

enum Lifecycle {
    Idle,
    Running(RunningPump),
    Stopped,
}

/// Consumes one topic and feeds every record to a dispatch pipeline, committing
/// offsets according to the delivery semantics.
///
/// A pump runs once: `start_pump` may be called a single time, and `stop_pump` is
/// idempotent and never fails.
pub struct TransportPump {
    options: PumpOptions,
    policy: CommitPolicy,
    factory: Arc<dyn BrokerClientFactory>,
    pipeline: Arc<dyn DispatchPipeline>,
    liveness: Option<HealthHandle>,
    state: Arc<watch::Sender<PumpState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl TransportPump {
    pub fn new(
        options: PumpOptions,
        factory: Arc<dyn BrokerClientFactory>,
        pipeline: Arc<dyn DispatchPipeline>,
    ) -> Result<Self, ConfigError> {
        let policy = options.validate()?;
        let (state, _) = watch::channel(PumpState::Created);

        info!(
            topic = options.topic.as_str(),
            semantics = %options.semantics,
            enable_auto_commit = policy.enable_auto_commit,
            enable_auto_offset_store = policy.enable_auto_offset_store,
            error_strategy = ?options.error_strategy,
            "Configured transport pump"
        );

        Ok(Self {
            options,
            policy,
            factory,
            pipeline,
            liveness: None,
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Report the poll loop on a liveness registry. A faulted loop reports unhealthy.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            policy: self.policy,
            auto_commit_interval: self.options.auto_commit_interval,
            enable_partition_eof: self.options.enable_partition_eof,
        }
    }

    pub fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PumpState> {
        self.state.subscribe()
    }

    pub async fn start_pump(&self) -> Result<(), PumpError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(PumpError::AlreadyStarted),
            Lifecycle::Stopped => return Err(PumpError::AlreadyStopped),
        }

        let mut consumer = self.factory.create_consumer(&self.consumer_settings())?;
        if let Err(e) = consumer.subscribe(&self.options.topic) {
            if let Err(close_error) = consumer.close() {
                warn!(error = %close_error, "Failed to close consumer after subscribe error");
            }
            return Err(e.into());
        }

        let dead_letter = match self.options.error_strategy {
            ErrorStrategy::DeadLetter => match self.factory.create_producer() {
                Ok(producer) => Some(producer),
                Err(e) => {
                    if let Err(close_error) = consumer.close() {
                        warn!(error = %close_error, "Failed to close consumer after producer error");
                    }
                    return Err(e.into());
                }
            },
            ErrorStrategy::Skip => None,
        };

        let (commits_tx, commits_rx) = commit_channel();
        let drain = Arc::new(DrainCoordinator::new());
        let teardown = CancellationToken::new();

        let shared = Arc::new(ContextShared {
            semantics: self.options.semantics,
            tracker: Arc::new(OffsetTracker::new(commits_tx)),
            dead_letter: dead_letter
                .clone()
                .zip(self.options.dead_letter_topic.clone())
                .map(|(producer, topic)| DeadLetter { producer, topic }),
            teardown: teardown.clone(),
        });

        let pump_loop = PumpLoop {
            consumer,
            policy: self.policy,
            shared,
            drain: drain.clone(),
            permits: Arc::new(Semaphore::new(self.options.max_in_flight)),
            pipeline: self.pipeline.clone(),
            commits: commits_rx,
            state: self.state.clone(),
            liveness: self.liveness.clone(),
            heartbeat: heartbeat(self.liveness.as_ref()),
        };

        let (exited_tx, poll_exited) = oneshot::channel();
        let poll = CancellationToken::new();
        let task_signals = LoopSignals {
            poll: poll.clone(),
            teardown: teardown.clone(),
            poll_exited: exited_tx,
        };

        // Set before spawning so a loop that faults straight away is not overwritten
        self.state.send_replace(PumpState::Running);
        let task = tokio::spawn(pump_loop.run(task_signals));

        *lifecycle = Lifecycle::Running(RunningPump {
            poll,
            teardown,
            poll_exited,
            task,
            drain,
            dead_letter,
        });

        info!(topic = self.options.topic.as_str(), "Started transport pump");
        Ok(())
    }

    /// Stop polling, wait up to `timeout` for dispatched records to finish, flush the
    /// dead letter producer and close the consumer. Safe to call more than once and
    /// before `start_pump`.
    pub async fn stop_pump(&self, timeout: Duration) {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            Lifecycle::Idle => {
                debug!("Stopping a pump that was never started");
                self.state.send_replace(PumpState::Stopped);
                return;
            }
            Lifecycle::Stopped => return,
        };

        info!(topic = self.options.topic.as_str(), "Stopping transport pump");
        self.state.send_replace(PumpState::Stopping);

        running.poll.cancel();
        if running.poll_exited.await.is_err() {
            warn!("Poll loop ended without reporting its exit");
        }

        if self.policy.enable_auto_commit {
            // Give the background committer one interval to pick up the last stored offsets
            tokio::time::sleep(self.options.auto_commit_interval).await;
        }

        match running.drain.begin_drain(timeout).await {
            true => {
                metrics::counter!(PUMP_DRAINS, "outcome" => "clean").increment(1);
                info!("All dispatched records finished before shutdown");
            }
            false => {
                metrics::counter!(PUMP_DRAINS, "outcome" => "timed_out").increment(1);
                warn!(
                    outstanding = running.drain.outstanding(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutting down with records still in flight"
                );
            }
        }

        if let Some(producer) = &running.dead_letter {
            if let Err(e) = producer.flush(timeout).await {
                warn!(error = %e, "Failed to flush dead letter producer");
            }
        }

        running.teardown.cancel();
        if let Err(e) = running.task.await {
            error!(error = %e, "Pump task failed");
        }

        self.state.send_replace(PumpState::Stopped);
        info!(topic = self.options.topic.as_str(), "Stopped transport pump");
    }
}

impl Drop for TransportPump {
    fn drop(&mut self) {
        // Without a stop the loop would outlive the pump; cancel it so it closes the consumer
        if let Lifecycle::Running(running) = self.lifecycle.get_mut() {
            warn!("Transport pump dropped while running");
            running.poll.cancel();
            running.teardown.cancel();
        }
    }
}
