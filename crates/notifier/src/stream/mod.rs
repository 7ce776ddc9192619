//! Append-only streams backing the queue transport and the dead-letter channel.

mod memory;
mod redis_stream;

pub use self::memory::MemoryStream;
pub use self::redis_stream::{ConsumerGroup, RedisStream};

use std::time::Duration;

use async_trait::async_trait;

use linkwatch_common::error::AppError;

/// Field holding the raw payload in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub payload: Vec<u8>,
}

/// Write side of a stream.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn topic(&self) -> &str;

    /// Append a payload. Returns the entry id.
    async fn publish(&self, payload: &[u8]) -> Result<String, AppError>;
}

/// Read side of a stream with at-least-once delivery.
#[async_trait]
pub trait MessageStream: Send + Sync {
    fn topic(&self) -> &str;

    /// Read the next batch of new entries, waiting briefly when none are available.
    async fn read_batch(&self) -> Result<Vec<QueueMessage>, AppError>;

    /// Entries this consumer read earlier and never acknowledged, oldest first.
    async fn read_pending(&self) -> Result<Vec<QueueMessage>, AppError>;

    /// Take over entries left unacknowledged by any consumer of the group for
    /// at least `min_idle`. Claimed entries count as freshly delivered.
    async fn claim_idle(&self, min_idle: Duration) -> Result<Vec<QueueMessage>, AppError>;

    /// Acknowledge an entry so it is not delivered again.
    async fn ack(&self, id: &str) -> Result<(), AppError>;
}
