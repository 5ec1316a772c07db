use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use once_cell::sync::Lazy;
use rdkafka::message::Headers;
use rdkafka::Message;
use regex::Regex;

use crate::error::ConfigError;

static TOPIC_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._\-]{1,255}$").expect("topic name pattern is valid"));

/// A topic name that passed broker naming validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(String);

impl TopicName {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        if TOPIC_NAME_PATTERN.is_match(name) {
            Ok(TopicName(name.to_owned()))
        } else {
            Err(ConfigError::InvalidTopicName(name.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TopicName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicName::parse(s)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Position of a processed record: the offset is the record's own offset,
/// not the next offset to consume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    topic_partition: TopicPartition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(topic_partition: TopicPartition, offset: i64) -> Self {
        Self {
            topic_partition,
            offset,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Option<Bytes>,
}

/// One record received from the broker. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    topic_partition: TopicPartition,
    offset: i64,
    key: Option<Bytes>,
    payload: Option<Bytes>,
    headers: Vec<RecordHeader>,
}

impl ConsumedRecord {
    pub fn new(topic_partition: TopicPartition, offset: i64) -> Self {
        Self {
            topic_partition,
            offset,
            key: None,
            payload: None,
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Option<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value,
        });
        self
    }

    /// Copy a polled message out of the client's buffers.
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| RecordHeader {
                        key: header.key.to_owned(),
                        value: header.value.map(Bytes::copy_from_slice),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic_partition: TopicPartition::new(message.topic(), message.partition()),
            offset: message.offset(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
            headers,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn headers(&self) -> &[RecordHeader] {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value.as_ref())
    }

    pub fn position(&self) -> PartitionOffset {
        PartitionOffset::new(self.topic_partition.clone(), self.offset)
    }

    /// Rough in-memory footprint, reported on the in-flight bytes gauge.
    pub fn estimated_size(&self) -> usize {
        self.payload.as_ref().map(Bytes::len).unwrap_or(0)
            + self.key.as_ref().map(Bytes::len).unwrap_or(0)
            + self.topic_partition.topic.len()
    }
}
