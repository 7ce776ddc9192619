use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};

use linkwatch_common::error::AppError;

use super::{MessageStream, PAYLOAD_FIELD, Publisher, QueueMessage};

/// Approximate cap on stream length, enforced with `XADD MAXLEN ~`.
const DEFAULT_MAX_LEN: usize = 10_000;

const DEFAULT_BATCH_SIZE: usize = 16;

const DEFAULT_BLOCK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroup {
    pub group: String,
    pub consumer: String,
}

/// A Redis stream used as a durable queue.
///
/// Producers `XADD`; consumers read through a consumer group with `XREADGROUP`
/// and acknowledge with `XACK`. Entries read but never acknowledged stay in
/// the group's pending list until they are re-read or claimed.
pub struct RedisStream {
    conn: ConnectionManager,
    topic: String,
    group: Option<ConsumerGroup>,
    max_len: usize,
    batch_size: usize,
    block: Duration,
}

impl RedisStream {
    /// Write-only handle.
    pub fn publisher(conn: ConnectionManager, topic: impl Into<String>) -> Self {
        Self {
            conn,
            topic: topic.into(),
            group: None,
            max_len: DEFAULT_MAX_LEN,
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
        }
    }

    /// Read/write handle bound to a consumer group. Creates the group (and the
    /// stream) if missing, starting from the oldest entry.
    ///
    /// Blocking reads tie up the connection, so give each consumer its own manager.
    pub async fn consumer(
        conn: ConnectionManager,
        topic: impl Into<String>,
        group: ConsumerGroup,
    ) -> Result<Self, AppError> {
        let mut stream = Self::publisher(conn, topic);
        stream.group = Some(group);
        stream.ensure_group().await?;
        Ok(stream)
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    fn group(&self) -> Result<&ConsumerGroup, AppError> {
        self.group.as_ref().ok_or_else(|| {
            AppError::Config(format!("stream '{}' has no consumer group", self.topic))
        })
    }

    async fn ensure_group(&self) -> Result<(), AppError> {
        let group = self.group()?;
        let mut conn = self.conn.clone();

        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.topic, &group.group, "0")
            .await;

        match created {
            Ok(()) => {
                tracing::info!(topic = %self.topic, group = %group.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Publisher for RedisStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<String, AppError> {
        let mut conn = self.conn.clone();

        // XADD topic MAXLEN ~ max_len * payload <bytes>
        let id: String = redis::cmd("XADD")
            .arg(&self.topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }
}

#[async_trait]
impl MessageStream for RedisStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read_batch(&self) -> Result<Vec<QueueMessage>, AppError> {
        let group = self.group()?;
        let mut conn = self.conn.clone();

        let options = StreamReadOptions::default()
            .group(&group.group, &group.consumer)
            .count(self.batch_size)
            .block(self.block.as_millis() as usize);

        // Nil when BLOCK times out without new entries.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.topic], &[">"], &options)
            .await?;

        Ok(messages(reply))
    }

    async fn read_pending(&self) -> Result<Vec<QueueMessage>, AppError> {
        let group = self.group()?;
        let mut conn = self.conn.clone();

        let options = StreamReadOptions::default()
            .group(&group.group, &group.consumer)
            .count(self.batch_size);

        // An explicit id pages through this consumer's pending list instead of new entries.
        let mut pending = Vec::new();
        let mut cursor = "0".to_string();
        loop {
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.topic], &[&cursor], &options)
                .await?;
            let page = messages(reply);
            match page.last() {
                Some(last) => cursor = last.id.clone(),
                None => break,
            }
            pending.extend(page);
        }

        if !pending.is_empty() {
            tracing::info!(topic = %self.topic, count = pending.len(), "Recovered pending entries");
        }
        Ok(pending)
    }

    async fn claim_idle(&self, min_idle: Duration) -> Result<Vec<QueueMessage>, AppError> {
        let group = self.group()?;
        let mut conn = self.conn.clone();

        let mut claimed = Vec::new();
        let mut cursor = "0-0".to_string();
        loop {
            let reply: StreamAutoClaimReply = conn
                .xautoclaim_options(
                    &self.topic,
                    &group.group,
                    &group.consumer,
                    min_idle.as_millis() as u64,
                    &cursor,
                    StreamAutoClaimOptions::default().count(self.batch_size),
                )
                .await?;

            if !reply.deleted_ids.is_empty() {
                tracing::warn!(
                    topic = %self.topic,
                    ids = ?reply.deleted_ids,
                    "Pending entries were trimmed before delivery"
                );
            }
            claimed.extend(reply.claimed.into_iter().map(message));

            if reply.next_stream_id == "0-0" {
                break;
            }
            cursor = reply.next_stream_id;
        }

        if !claimed.is_empty() {
            tracing::info!(topic = %self.topic, count = claimed.len(), "Claimed idle entries");
        }
        Ok(claimed)
    }

    async fn ack(&self, id: &str) -> Result<(), AppError> {
        let group = self.group()?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(&self.topic, &group.group, &[id]).await?;
        Ok(())
    }
}

fn message(entry: StreamId) -> QueueMessage {
    let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
    QueueMessage {
        id: entry.id,
        payload,
    }
}

fn messages(reply: Option<StreamReadReply>) -> Vec<QueueMessage> {
    reply
        .map(|reply| {
            reply
                .keys
                .into_iter()
                .flat_map(|key| key.ids)
                .map(message)
                .collect()
        })
        .unwrap_or_default()
}
