//! Kafka transport pump.
//!
//! Consumes one topic, hands every record to a dispatch pipeline and commits
//! offsets so that, under at-least-once delivery, the committed position never
//! passes a record whose handling has not finished.
//!
//! ## Error logging
//!
//! Broker failures carry the rdkafka error code in `BrokerError::code`; log it as
//! its own field (`code = %e.code`) so failures can be grouped by code.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod drain;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod pipeline;
mod pump;
pub mod receive_context;
pub mod test_utils;
pub mod transport;
pub mod types;

// Re-export commonly used types for convenience
pub use delivery::{CommitPolicy, CommitStrategy, DeliverySemantics};
pub use pipeline::{DispatchPipeline, MessageContext};
pub use transport::{ErrorStrategy, PumpOptions, PumpState, TransportPump};
