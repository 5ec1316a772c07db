// ==== Pump loop metrics ====
/// Counter for records polled from the broker
pub const PUMP_RECORDS_RECEIVED: &str = "kafka_pump_records_received_total";

/// Counter for end-of-partition markers skipped by the loop
pub const PUMP_PARTITION_EOF: &str = "kafka_pump_partition_eof_total";

/// Counter for broker errors seen while polling, labelled by level
pub const PUMP_BROKER_ERRORS: &str = "kafka_pump_broker_errors_total";

/// Counter for offsets handed to the broker, labelled by commit or store
pub const PUMP_OFFSETS_ADVANCED: &str = "kafka_pump_offsets_advanced_total";

/// Counter for failed commit or store calls
pub const PUMP_OFFSET_ADVANCE_FAILED: &str = "kafka_pump_offset_advance_failed_total";

/// Gauge for the last offset handed to the broker per partition
pub const PUMP_PARTITION_ADVANCED_OFFSET: &str = "kafka_pump_partition_advanced_offset";

/// Counter for dispatches that returned an error from the pipeline
pub const PUMP_DISPATCH_ERRORS: &str = "kafka_pump_dispatch_errors_total";

/// Histogram for seconds spent waiting for an in-flight permit
pub const PUMP_PERMIT_WAIT: &str = "kafka_pump_permit_wait_seconds";

/// Counter for partitions whose ledgers were cleared on revocation
pub const PUMP_PARTITIONS_REVOKED: &str = "kafka_pump_partitions_revoked_total";

/// Counter for drains, labelled clean or timed_out
pub const PUMP_DRAINS: &str = "kafka_pump_drains_total";

// ==== Receive context metrics ====
/// Gauge for receive contexts not yet finalized
pub const PUMP_IN_FLIGHT: &str = "kafka_pump_in_flight_contexts";

/// Gauge for estimated bytes held by receive contexts not yet finalized
pub const PUMP_IN_FLIGHT_BYTES: &str = "kafka_pump_in_flight_bytes";

/// Counter for finalized receive contexts, labelled completed or abandoned
pub const PUMP_CONTEXTS_FINALIZED: &str = "kafka_pump_contexts_finalized_total";

/// Counter for receive contexts dropped while still active
pub const PUMP_CONTEXTS_DROPPED: &str = "kafka_pump_contexts_dropped_total";

/// Histogram for seconds between dispatch and finalization
pub const PUMP_PROCESSING_DURATION: &str = "kafka_pump_processing_duration_seconds";

/// Counter for abandoned records published to the dead letter topic
pub const PUMP_DEAD_LETTERED: &str = "kafka_pump_dead_lettered_total";

// ==== Offset tracker metrics ====
/// Gauge for offsets waiting on a processed prefix, per partition
pub const OFFSET_TRACKER_PENDING_OFFSETS: &str = "kafka_pump_pending_offsets";

/// Counter for completions that could not advance the partition
pub const OFFSET_TRACKER_OUT_OF_ORDER_COMPLETIONS: &str = "kafka_pump_out_of_order_completions_total";

/// Counter for completions naming an offset the tracker does not hold
pub const OFFSET_TRACKER_UNKNOWN_OFFSET: &str = "kafka_pump_unknown_offset_total";

/// Counter for completions of records received before their partition was revoked
pub const OFFSET_TRACKER_STALE_COMPLETIONS: &str = "kafka_pump_stale_completions_total";

// ==== Kafka client metrics ====
/// Counter for background commit callbacks, labelled by outcome
pub const KAFKA_COMMIT_CALLBACKS: &str = "kafka_pump_commit_callbacks_total";
