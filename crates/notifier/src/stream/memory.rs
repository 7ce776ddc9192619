use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use linkwatch_common::error::AppError;

use super::{MessageStream, Publisher, QueueMessage};

const EMPTY_READ_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Delivery {
    message: QueueMessage,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    /// Entries not yet read.
    queued: VecDeque<QueueMessage>,
    /// Entries read but not acknowledged, keyed by sequence number.
    pending: BTreeMap<u64, Delivery>,
    /// Every payload ever published, in order.
    log: Vec<Vec<u8>>,
    fail_publishes: bool,
}

impl State {
    /// Re-deliver pending entries matching `due`, oldest first.
    fn redeliver(&mut self, due: impl Fn(&Delivery) -> bool) -> Vec<QueueMessage> {
        let now = Instant::now();
        self.pending
            .values_mut()
            .filter(|delivery| due(delivery))
            .map(|delivery| {
                delivery.delivered_at = now;
                delivery.message.clone()
            })
            .collect()
    }
}

fn sequence(id: &str) -> Option<u64> {
    id.split_once('-').and_then(|(seq, _)| seq.parse().ok())
}

/// In-process stream with the same read/ack semantics as `RedisStream`.
///
/// Used by tests and single-process setups where Redis is not available.
/// There is one implicit consumer, so its pending list is the group's.
pub struct MemoryStream {
    topic: String,
    state: Mutex<State>,
}

impl MemoryStream {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every subsequent publish fail with a transient error.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// All payloads published so far.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state.lock().log.clone()
    }

    /// Ids read but not acknowledged, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .values()
            .map(|delivery| delivery.message.id.clone())
            .collect()
    }

    /// Number of entries waiting to be read.
    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }
}

#[async_trait]
impl Publisher for MemoryStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, payload: &[u8]) -> Result<String, AppError> {
        let mut state = self.state.lock();
        if state.fail_publishes {
            return Err(AppError::Internal(format!(
                "stream '{}' is unavailable",
                self.topic
            )));
        }

        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.log.push(payload.to_vec());
        state.queued.push_back(QueueMessage {
            id: id.clone(),
            payload: payload.to_vec(),
        });
        Ok(id)
    }
}

#[async_trait]
impl MessageStream for MemoryStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read_batch(&self) -> Result<Vec<QueueMessage>, AppError> {
        let batch: Vec<QueueMessage> = {
            let mut state = self.state.lock();
            let batch: Vec<QueueMessage> = state.queued.drain(..).collect();
            let now = Instant::now();
            for message in &batch {
                if let Some(seq) = sequence(&message.id) {
                    state.pending.insert(
                        seq,
                        Delivery {
                            message: message.clone(),
                            delivered_at: now,
                        },
                    );
                }
            }
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(EMPTY_READ_PAUSE).await;
        }
        Ok(batch)
    }

    async fn read_pending(&self) -> Result<Vec<QueueMessage>, AppError> {
        Ok(self.state.lock().redeliver(|_| true))
    }

    async fn claim_idle(&self, min_idle: Duration) -> Result<Vec<QueueMessage>, AppError> {
        Ok(self
            .state
            .lock()
            .redeliver(|delivery| delivery.delivered_at.elapsed() >= min_idle))
    }

    async fn ack(&self, id: &str) -> Result<(), AppError> {
        if let Some(seq) = sequence(id) {
            self.state.lock().pending.remove(&seq);
        }
        Ok(())
    }
}
