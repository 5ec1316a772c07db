//! Delivery policy: maps the requested delivery semantics plus any explicit
//! low-level commit flags to the concrete consumer commit configuration.
//!
//! Resolution is a pure decision table. Explicit flags must name one of the
//! supported strategies:
//!
//! | semantics     | enable.auto.commit | enable.auto.offset.store | strategy    |
//! |---------------|--------------------|--------------------------|-------------|
//! | at most once  | unset              | unset                    | per message |
//! | at most once  | false              | unset / false            | per message |
//! | at least once | unset              | unset                    | batch       |
//! | at least once | false              | unset / false            | per message |
//! | at least once | true               | false                    | batch       |
//!
//! Any other combination is rejected. Automatic offset storing is never allowed,
//! since it would let the client commit offsets of records nobody processed yet.
//! At most once only commits synchronously per message: a background committer
//! could lose the pre-dispatch commit and redeliver an already processed record.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliverySemantics {
    AtMostOnce,
    AtLeastOnce,
}

impl fmt::Display for DeliverySemantics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliverySemantics::AtMostOnce => f.write_str("at_most_once"),
            DeliverySemantics::AtLeastOnce => f.write_str("at_least_once"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDeliverySemanticsError(String);

impl fmt::Display for ParseDeliverySemanticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} is not a delivery semantics, expected at_most_once or at_least_once",
            self.0
        )
    }
}

impl std::error::Error for ParseDeliverySemanticsError {}

impl FromStr for DeliverySemantics {
    type Err = ParseDeliverySemanticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "at_most_once" | "atmostonce" => Ok(DeliverySemantics::AtMostOnce),
            "at_least_once" | "atleastonce" => Ok(DeliverySemantics::AtLeastOnce),
            _ => Err(ParseDeliverySemanticsError(s.to_owned())),
        }
    }
}

/// How processed offsets reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Every advance is committed synchronously by the pump.
    PerMessage,
    /// Advances are stored locally and the client's background timer commits them.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub enable_auto_commit: bool,
    pub enable_auto_offset_store: bool,
}

impl CommitPolicy {
    pub fn strategy(&self) -> CommitStrategy {
        if self.enable_auto_commit {
            CommitStrategy::Batch
        } else {
            CommitStrategy::PerMessage
        }
    }
}

const PER_MESSAGE: CommitPolicy = CommitPolicy {
    enable_auto_commit: false,
    enable_auto_offset_store: false,
};

const BATCH: CommitPolicy = CommitPolicy {
    enable_auto_commit: true,
    enable_auto_offset_store: false,
};

pub fn resolve(
    semantics: DeliverySemantics,
    explicit_auto_commit: Option<bool>,
    explicit_auto_offset_store: Option<bool>,
) -> Result<CommitPolicy, ConfigError> {
    use crate::delivery::DeliverySemantics::{AtLeastOnce, AtMostOnce};

    match (semantics, explicit_auto_commit, explicit_auto_offset_store) {
        (AtMostOnce, None, None) => Ok(PER_MESSAGE),
        (AtLeastOnce, None, None) => Ok(BATCH),

        (AtMostOnce, Some(false), None | Some(false)) => Ok(PER_MESSAGE),
        (AtLeastOnce, Some(false), None | Some(false)) => Ok(PER_MESSAGE),
        (AtLeastOnce, Some(true), Some(false)) => Ok(BATCH),

        (semantics, auto_commit, auto_offset_store) => {
            Err(ConfigError::InvalidCommitConfiguration {
                semantics,
                auto_commit,
                auto_offset_store,
            })
        }
    }
}
