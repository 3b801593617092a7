use crate::error::BoxError;
use async_trait::async_trait;
use std::time::Duration;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Bus-assigned identifier used to acknowledge the message
    pub id: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub attempt: u32,
}

/// At-least-once message bus with durable consumer groups.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a keyed payload to a topic
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), BoxError>;

    /// Make sure the consumer group exists before reading
    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BoxError>;

    /// Receive the next message for `consumer` within `group`.
    /// Returns `None` when nothing arrived before `timeout`.
    async fn receive(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BoxError>;

    /// Acknowledge a handled message so it is never redelivered
    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BoxError>;
}
