use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::ContextError;
use crate::receive_context::ReceiveContext;
use crate::types::{ConsumedRecord, RecordHeader, TopicPartition};

/// Header carrying the producer-assigned message id, when present.
pub const MESSAGE_ID_HEADER: &str = "message-id";

/// A record handed to the dispatch pipeline, together with the handle the
/// pipeline uses to finish it.
pub struct MessageContext {
    message_id: String,
    receive_context: Arc<ReceiveContext>,
}

impl MessageContext {
    pub fn new(receive_context: Arc<ReceiveContext>) -> Self {
        let message_id = receive_context
            .record()
            .header(MESSAGE_ID_HEADER)
            .and_then(|id| std::str::from_utf8(id).ok())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Self {
            message_id,
            receive_context,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn record(&self) -> &ConsumedRecord {
        self.receive_context.record()
    }

    /// Payload bytes; a tombstone yields an empty body.
    pub fn body(&self) -> Bytes {
        self.record().payload().cloned().unwrap_or_default()
    }

    pub fn headers(&self) -> &[RecordHeader] {
        self.record().headers()
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        self.record().topic_partition()
    }

    pub fn offset(&self) -> i64 {
        self.record().offset()
    }

    pub fn receive_context(&self) -> &Arc<ReceiveContext> {
        &self.receive_context
    }

    pub async fn complete(&self) -> Result<(), ContextError> {
        self.receive_context.complete().await
    }

    pub async fn abandon(&self) -> Result<(), ContextError> {
        self.receive_context.abandon().await
    }
}

/// The request-dispatch pipeline that processes decoded messages. It must
/// eventually call `complete` or `abandon` on every message it is handed.
/// Errors returned here are logged and otherwise belong to the pipeline.
#[async_trait]
pub trait DispatchPipeline: Send + Sync + 'static {
    async fn dispatch(&self, message: MessageContext) -> anyhow::Result<()>;
}
