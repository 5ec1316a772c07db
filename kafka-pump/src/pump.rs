//! The poll loop. One task owns the consumer for the whole run: it polls records,
//! hands them to the pipeline, and applies commit intents coming back from the
//! offset tracker, so the consumer handle is never touched concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConsumer, PollEvent};
use crate::delivery::{CommitPolicy, CommitStrategy, DeliverySemantics};
use crate::drain::DrainCoordinator;
use crate::error::{BrokerError, PumpError};
use crate::health::HealthHandle;
use crate::metrics_consts::{
    PUMP_BROKER_ERRORS, PUMP_DISPATCH_ERRORS, PUMP_OFFSETS_ADVANCED, PUMP_OFFSET_ADVANCE_FAILED,
    PUMP_PARTITIONS_REVOKED, PUMP_PARTITION_ADVANCED_OFFSET, PUMP_PARTITION_EOF, PUMP_PERMIT_WAIT,
    PUMP_RECORDS_RECEIVED,
};
use crate::offset_tracker::CommitReceiver;
use crate::pipeline::{DispatchPipeline, MessageContext};
use crate::receive_context::{ContextShared, ReceiveContext};
use crate::transport::PumpState;
use crate::types::{ConsumedRecord, PartitionOffset};

const MAX_BACKOFF_STEPS: u32 = 10;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub(crate) enum LoopExit {
    Cancelled,
    Faulted(PumpError),
}

/// Tokens and signals the facade uses to walk the loop through shutdown.
pub(crate) struct LoopSignals {
    /// Stops polling. Commit intents are still applied afterwards.
    pub poll: CancellationToken,
    /// Stops applying commit intents and closes the consumer.
    pub teardown: CancellationToken,
    pub poll_exited: oneshot::Sender<()>,
}

pub(crate) struct PumpLoop {
    pub consumer: Box<dyn BrokerConsumer>,
    pub policy: CommitPolicy,
    pub shared: Arc<ContextShared>,
    pub drain: Arc<DrainCoordinator>,
    pub permits: Arc<Semaphore>,
    pub pipeline: Arc<dyn DispatchPipeline>,
    pub commits: CommitReceiver,
    pub state: Arc<watch::Sender<PumpState>>,
    pub liveness: Option<HealthHandle>,
    pub heartbeat: Option<Interval>,
}

/// Ticks at the liveness report interval, so an idle topic or a long wait for an
/// in-flight slot still reports healthy.
pub(crate) fn heartbeat(liveness: Option<&HealthHandle>) -> Option<Interval> {
    liveness.map(|handle| {
        let mut interval = tokio::time::interval(handle.report_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn next_beat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum Flow {
    Continue,
    Exit(LoopExit),
}

impl PumpLoop {
    pub async fn run(mut self, signals: LoopSignals) {
        match self.poll_phase(&signals.poll).await {
            LoopExit::Cancelled => info!("Poll loop stopped"),
            LoopExit::Faulted(e) => {
                error!(error = %e, "Poll loop faulted, no further records will be consumed");
                if let Some(liveness) = &self.liveness {
                    liveness.report_unhealthy(e.to_string());
                }
                self.state.send_replace(PumpState::Faulted);
            }
        }

        if signals.poll_exited.send(()).is_err() {
            debug!("Nobody is waiting for the poll loop to exit");
        }

        self.serve_commits(&signals.teardown).await;

        if let Err(e) = self.consumer.close() {
            warn!(error = %e, code = %e.code, "Failed to close consumer cleanly");
        }
    }

    async fn poll_phase(&mut self, cancel: &CancellationToken) -> LoopExit {
        let mut consecutive_errors: u32 = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = next_beat(&mut self.heartbeat) => {
                    self.report_healthy();
                    continue;
                }
                Some(position) = self.commits.recv() => {
                    self.apply_commit_intent(&position);
                    continue;
                }
                event = self.consumer.poll(cancel) => event,
            };

            match event {
                Ok(PollEvent::Cancelled) => return LoopExit::Cancelled,

                Ok(PollEvent::EndOfPartition(partition)) => {
                    consecutive_errors = 0;
                    metrics::counter!(PUMP_PARTITION_EOF).increment(1);
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "Reached end of partition"
                    );
                }

                Ok(PollEvent::PartitionsRevoked(partitions)) => {
                    consecutive_errors = 0;
                    metrics::counter!(PUMP_PARTITIONS_REVOKED).increment(partitions.len() as u64);
                    // Anything still in flight for these partitions finishes without
                    // advancing, and redelivered offsets start a fresh ledger
                    for partition in &partitions {
                        self.shared.tracker.clear_partition(partition);
                    }
                    info!(partitions = ?partitions, "Partitions revoked");
                }

                Ok(PollEvent::Record(record)) => {
                    consecutive_errors = 0;
                    metrics::counter!(PUMP_RECORDS_RECEIVED).increment(1);
                    if let Flow::Exit(exit) = self.accept(record, cancel).await {
                        return exit;
                    }
                }

                Err(e) if e.is_fatal() => {
                    metrics::counter!(PUMP_BROKER_ERRORS, "level" => "fatal").increment(1);
                    return LoopExit::Faulted(e.into());
                }

                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    metrics::counter!(PUMP_BROKER_ERRORS, "level" => "warn").increment(1);
                    warn!(
                        error = %e,
                        code = %e.code,
                        consecutive_errors,
                        "Transient broker error while polling"
                    );

                    let backoff = BACKOFF_STEP * consecutive_errors.min(MAX_BACKOFF_STEPS);
                    tokio::select! {
                        _ = cancel.cancelled() => return LoopExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Register a polled record and hand it to the pipeline.
    async fn accept(&mut self, record: ConsumedRecord, cancel: &CancellationToken) -> Flow {
        let Some(permit) = self.acquire_permit(cancel).await else {
            // Neither committed nor tracked, so it is redelivered after a restart
            debug!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "Stopped while waiting for an in-flight slot"
            );
            return Flow::Exit(LoopExit::Cancelled);
        };

        let epoch = match self.shared.semantics {
            // Committed before the pipeline sees the record, so a crash loses it
            // rather than repeating it
            DeliverySemantics::AtMostOnce => {
                if let Err(e) = self.advance(&record.position()) {
                    if e.is_fatal() {
                        return Flow::Exit(LoopExit::Faulted(e.into()));
                    }
                    warn!(
                        topic = record.topic(),
                        partition = record.partition(),
                        offset = record.offset(),
                        error = %e,
                        "Skipping record whose offset could not be committed"
                    );
                    return Flow::Continue;
                }
                None
            }
            DeliverySemantics::AtLeastOnce => match self.shared.tracker.received(&record) {
                Ok(epoch) => Some(epoch),
                Err(e) => return Flow::Exit(LoopExit::Faulted(e.into())),
            },
        };

        let shared = self.shared.clone();
        let context = match ReceiveContext::new(record, epoch, shared, &self.drain, Some(permit)) {
            Ok(context) => Arc::new(context),
            Err(e) => {
                warn!(error = %e, "Drain started while the poll loop was still running");
                return Flow::Exit(LoopExit::Cancelled);
            }
        };

        let message = MessageContext::new(context);
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let message_id = message.message_id().to_owned();
            let position = message.record().position();

            if let Err(e) = pipeline.dispatch(message).await {
                metrics::counter!(PUMP_DISPATCH_ERRORS).increment(1);
                warn!(
                    message_id = %message_id,
                    topic = position.topic(),
                    partition = position.partition(),
                    offset = position.offset(),
                    error = ?e,
                    "Dispatch pipeline returned an error"
                );
            }
        });

        Flow::Continue
    }

    /// Wait for an in-flight slot, applying commit intents meanwhile so finished
    /// records keep advancing. Returns `None` if the poll token fires first.
    async fn acquire_permit(&mut self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        let started = Instant::now();

        let permit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = next_beat(&mut self.heartbeat) => self.report_healthy(),
                Some(position) = self.commits.recv() => self.apply_commit_intent(&position),
                permit = self.permits.clone().acquire_owned() => break permit.ok()?,
            }
        };

        metrics::histogram!(PUMP_PERMIT_WAIT).record(started.elapsed().as_secs_f64());
        Some(permit)
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }

    /// Hand a processed position to the broker, by commit or by store depending on
    /// the commit policy.
    fn advance(&mut self, position: &PartitionOffset) -> Result<(), BrokerError> {
        let (operation, result) = match self.policy.strategy() {
            CommitStrategy::PerMessage => ("commit", self.consumer.commit(position)),
            CommitStrategy::Batch => ("store", self.consumer.store_offset(position)),
        };

        match &result {
            Ok(()) => {
                metrics::counter!(PUMP_OFFSETS_ADVANCED, "operation" => operation).increment(1);
                metrics::gauge!(
                    PUMP_PARTITION_ADVANCED_OFFSET,
                    "topic" => position.topic().to_string(),
                    "partition" => position.partition().to_string()
                )
                .set(position.offset() as f64);
                debug!(
                    topic = position.topic(),
                    partition = position.partition(),
                    offset = position.offset(),
                    operation,
                    "Advanced offset"
                );
            }
            Err(_) => {
                metrics::counter!(PUMP_OFFSET_ADVANCE_FAILED, "operation" => operation)
                    .increment(1);
            }
        }
        result
    }

    fn apply_commit_intent(&mut self, position: &PartitionOffset) {
        if let Err(e) = self.advance(position) {
            // A later prefix covers this offset, so the next intent retries it
            warn!(
                topic = position.topic(),
                partition = position.partition(),
                offset = position.offset(),
                error = %e,
                code = %e.code,
                "Failed to advance offset"
            );
        }
    }

    /// Keep applying intents from records that finish after polling stopped.
    async fn serve_commits(&mut self, teardown: &CancellationToken) {
        loop {
            tokio::select! {
                biased;
                Some(position) = self.commits.recv() => self.apply_commit_intent(&position),
                _ = teardown.cancelled() => break,
            }
        }

        while let Ok(position) = self.commits.try_recv() {
            self.apply_commit_intent(&position);
        }
    }
}
