use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::BrokerProducer;
use crate::delivery::DeliverySemantics;
use crate::drain::{DrainCoordinator, DrainError, DrainToken};
use crate::error::ContextError;
use crate::metrics_consts::{
    PUMP_CONTEXTS_DROPPED, PUMP_CONTEXTS_FINALIZED, PUMP_DEAD_LETTERED, PUMP_IN_FLIGHT,
    PUMP_IN_FLIGHT_BYTES, PUMP_PROCESSING_DURATION,
};
use crate::offset_tracker::{LedgerEpoch, OffsetTracker};
use crate::types::{ConsumedRecord, TopicName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    Active = 0,
    Completed = 1,
    Abandoned = 2,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ContextState::Completed,
            2 => ContextState::Abandoned,
            _ => ContextState::Active,
        }
    }
}

pub(crate) struct DeadLetter {
    pub producer: Arc<dyn BrokerProducer>,
    pub topic: TopicName,
}

/// Pump state every receive context needs to finish its record.
pub(crate) struct ContextShared {
    pub semantics: DeliverySemantics,
    pub tracker: Arc<OffsetTracker>,
    pub dead_letter: Option<DeadLetter>,
    /// Fired when the pump tears down its broker handles.
    pub teardown: CancellationToken,
}

/// Resources an active context holds. Dropping it releases the drain count and
/// the in-flight permit.
struct Lease {
    _drain: DrainToken,
    _permit: Option<OwnedSemaphorePermit>,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        metrics::gauge!(PUMP_IN_FLIGHT).decrement(1.0);
        metrics::gauge!(PUMP_IN_FLIGHT_BYTES).decrement(self.bytes as f64);
    }
}

/// Per-record handle given to the dispatch pipeline. Exactly one successful
/// `complete` or `abandon` finalizes it; later calls are rejected without touching
/// the ledger or the drain count.
pub struct ReceiveContext {
    record: ConsumedRecord,
    /// Set when the record was registered with the offset tracker.
    epoch: Option<LedgerEpoch>,
    shared: Arc<ContextShared>,
    state: AtomicU8,
    lease: Mutex<Option<Lease>>,
    created_at: Instant,
}

impl ReceiveContext {
    pub(crate) fn new(
        record: ConsumedRecord,
        epoch: Option<LedgerEpoch>,
        shared: Arc<ContextShared>,
        drain: &Arc<DrainCoordinator>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self, DrainError> {
        let drain = drain.enter()?;
        let bytes = record.estimated_size();
        metrics::gauge!(PUMP_IN_FLIGHT).increment(1.0);
        metrics::gauge!(PUMP_IN_FLIGHT_BYTES).increment(bytes as f64);

        Ok(Self {
            record,
            epoch,
            shared,
            state: AtomicU8::new(ContextState::Active as u8),
            lease: Mutex::new(Some(Lease {
                _drain: drain,
                _permit: permit,
                bytes,
            })),
            created_at: Instant::now(),
        })
    }

    pub fn record(&self) -> &ConsumedRecord {
        &self.record
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move out of `Active`, handing back the lease so the caller releases it when
    /// done, whatever the outcome.
    fn finalize(&self, terminal: ContextState) -> Result<Option<Lease>, ContextError> {
        if let Err(current) = self.state.compare_exchange(
            ContextState::Active as u8,
            terminal as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            let current = ContextState::from_u8(current);
            warn!(
                topic = self.record.topic(),
                partition = self.record.partition(),
                offset = self.record.offset(),
                state = ?current,
                attempted = ?terminal,
                "Receive context finalized twice"
            );
            return Err(ContextError::AlreadyFinalized(current));
        }

        Ok(self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take())
    }

    /// Undo a `finalize` whose side effects failed, so the caller can try again.
    fn reopen(&self, lease: Option<Lease>) {
        *self.lease.lock().unwrap_or_else(PoisonError::into_inner) = lease;
        self.state.store(ContextState::Active as u8, Ordering::SeqCst);
    }

    fn record_finalized(&self, terminal: ContextState) {
        let status = match terminal {
            ContextState::Completed => "completed",
            _ => "abandoned",
        };
        metrics::counter!(PUMP_CONTEXTS_FINALIZED, "status" => status).increment(1);
        metrics::histogram!(PUMP_PROCESSING_DURATION, "status" => status)
            .record(self.created_at.elapsed().as_secs_f64());
    }

    fn advance(&self) -> Result<(), ContextError> {
        match (self.shared.semantics, self.epoch) {
            (DeliverySemantics::AtLeastOnce, Some(epoch)) => {
                self.shared.tracker.mark_as_processed(&self.record, epoch)?;
                Ok(())
            }
            // At most once commits before dispatch
            _ => Ok(()),
        }
    }

    /// The record was handled successfully.
    pub async fn complete(&self) -> Result<(), ContextError> {
        let lease = self.finalize(ContextState::Completed)?;
        self.record_finalized(ContextState::Completed);

        debug!(
            topic = self.record.topic(),
            partition = self.record.partition(),
            offset = self.record.offset(),
            "Completed record"
        );
        // Advance before the lease goes so the commit intent is queued ahead of the drain release
        let result = self.advance();
        drop(lease);
        result
    }

    /// The record could not be handled. With a dead letter topic configured it is
    /// republished there first. A failed publish is returned and leaves the context
    /// active, so the handler can retry `abandon` or `complete` it; the ledger does
    /// not move past the record until one of them succeeds.
    pub async fn abandon(&self) -> Result<(), ContextError> {
        let lease = self.finalize(ContextState::Abandoned)?;

        if let Some(dead_letter) = &self.shared.dead_letter {
            if let Err(e) = dead_letter
                .producer
                .produce(&dead_letter.topic, &self.record, &self.shared.teardown)
                .await
            {
                error!(
                    topic = self.record.topic(),
                    partition = self.record.partition(),
                    offset = self.record.offset(),
                    dead_letter_topic = dead_letter.topic.as_str(),
                    error = %e,
                    code = %e.code,
                    "Failed to publish abandoned record to dead letter topic, record stays active"
                );
                self.reopen(lease);
                return Err(ContextError::DeadLetter(e));
            }

            metrics::counter!(PUMP_DEAD_LETTERED).increment(1);
            warn!(
                topic = self.record.topic(),
                partition = self.record.partition(),
                offset = self.record.offset(),
                dead_letter_topic = dead_letter.topic.as_str(),
                "Abandoned record published to dead letter topic"
            );
        } else {
            warn!(
                topic = self.record.topic(),
                partition = self.record.partition(),
                offset = self.record.offset(),
                "Abandoned record skipped"
            );
        }

        self.record_finalized(ContextState::Abandoned);
        let result = self.advance();
        drop(lease);
        result
    }
}

impl Drop for ReceiveContext {
    fn drop(&mut self) {
        if self.state() == ContextState::Active {
            // The lease still releases the drain count and permit; the ledger keeps
            // the offset pending so the record is redelivered after a restart.
            error!(
                topic = self.record.topic(),
                partition = self.record.partition(),
                offset = self.record.offset(),
                "Receive context dropped without complete or abandon"
            );
            metrics::counter!(PUMP_CONTEXTS_DROPPED).increment(1);
        }
    }
}
