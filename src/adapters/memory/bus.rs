use crate::error::BoxError;
use crate::ports::bus::{Delivery, MessageBus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Longest single wait before pending redeliveries are re-examined.
const RECHECK_INTERVAL: Duration = Duration::from_millis(20);

struct Message {
    id: String,
    key: Vec<u8>,
    payload: Vec<u8>,
}

struct PendingEntry {
    index: usize,
    attempt: u32,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    /// Index of the next never-delivered message
    next: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct Topic {
    messages: Vec<Message>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    dropped: usize,
}

/// At-least-once bus kept in memory, with consumer groups and redelivery of unacked messages.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    redeliver_after: Duration,
    max_deliveries: u32,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Unacknowledged messages are redelivered immediately, up to 3 deliveries
    pub fn new() -> Self {
        Self::with_redelivery(Duration::ZERO, 3)
    }

    pub fn with_redelivery(redeliver_after: Duration, max_deliveries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            redeliver_after,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Every `(key, payload)` published to a topic, oldest first
    pub fn published(&self, topic: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|t| {
                t.messages
                    .iter()
                    .map(|m| (m.key.clone(), m.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delivered but unacknowledged messages of a group
    pub fn pending_count(&self, topic: &str, group: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Messages dropped after exhausting their deliveries
    pub fn dropped_count(&self) -> usize {
        self.state.lock().dropped
    }

    fn take_next(&self, topic: &str, group: &str) -> Result<Option<Delivery>, BoxError> {
        let mut state = self.state.lock();
        let State { topics, dropped } = &mut *state;
        let topic_state = topics
            .get_mut(topic)
            .ok_or_else(|| format!("unknown topic {}", topic))?;
        let group_state = topic_state
            .groups
            .get_mut(group)
            .ok_or_else(|| format!("unknown consumer group {} on {}", group, topic))?;

        let mut due: Vec<&String> = group_state
            .pending
            .iter()
            .filter(|(_, entry)| entry.delivered_at.elapsed() >= self.redeliver_after)
            .map(|(id, _)| id)
            .collect();
        due.sort_by_key(|id| group_state.pending[*id].index);
        let due: Vec<String> = due.into_iter().cloned().collect();

        for id in due {
            let Some(entry) = group_state.pending.get_mut(&id) else {
                continue;
            };
            if entry.attempt >= self.max_deliveries {
                tracing::error!(topic, group, message_id = %id, "message exceeded its deliveries, dropping");
                group_state.pending.remove(&id);
                *dropped += 1;
                continue;
            }
            entry.attempt += 1;
            entry.delivered_at = Instant::now();
            let message = &topic_state.messages[entry.index];
            return Ok(Some(Delivery {
                id: message.id.clone(),
                key: message.key.clone(),
                payload: message.payload.clone(),
                attempt: entry.attempt,
            }));
        }

        if group_state.next < topic_state.messages.len() {
            let index = group_state.next;
            group_state.next += 1;
            let message = &topic_state.messages[index];
            group_state.pending.insert(
                message.id.clone(),
                PendingEntry {
                    index,
                    attempt: 1,
                    delivered_at: Instant::now(),
                },
            );
            return Ok(Some(Delivery {
                id: message.id.clone(),
                key: message.key.clone(),
                payload: message.payload.clone(),
                attempt: 1,
            }));
        }
        Ok(None)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), BoxError> {
        {
            let mut state = self.state.lock();
            let topic_state = state.topics.entry(topic.to_string()).or_default();
            let id = format!("{}-0", topic_state.messages.len() + 1);
            topic_state.messages.push(Message {
                id,
                key: key.to_vec(),
                payload: payload.to_vec(),
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BoxError> {
        self.state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        _consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BoxError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.take_next(topic, group)? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(RECHECK_INTERVAL);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BoxError> {
        if let Some(group_state) = self
            .state
            .lock()
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
        {
            group_state.pending.remove(id);
        }
        Ok(())
    }
}
