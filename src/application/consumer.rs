use crate::config::BusConfig;
use crate::error::{BoxError, Retryable};
use crate::ports::bus::{Delivery, MessageBus};
use async_trait::async_trait;
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handles one message of a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: Retryable + Display + Send;

    async fn handle(&self, delivery: &Delivery, cancel: &CancellationToken) -> Result<(), Self::Error>;
}

/// Where and how a consumer loop reads.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub topic: String,
    pub group: String,
    pub consumer: String,
    pub poll_timeout: Duration,
    pub backoff: Duration,
}

impl Subscription {
    pub fn processing(config: &BusConfig) -> Self {
        Self::new(config, &config.topics.processing, &config.processing_group)
    }

    pub fn track_sync(config: &BusConfig) -> Self {
        Self::new(config, &config.topics.track_sync, &config.track_sync_group)
    }

    fn new(config: &BusConfig, topic: &str, group: &str) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: config.consumer_name.clone(),
            poll_timeout: config.poll_timeout,
            backoff: config.backoff,
        }
    }
}

pub struct ConsumerLoop<B> {
    bus: B,
    subscription: Subscription,
}

impl<B> ConsumerLoop<B>
where
    B: MessageBus,
{
    pub fn new(bus: B, subscription: Subscription) -> Self {
        Self { bus, subscription }
    }

    /// Consume until `cancel` fires.
    ///
    /// Messages are acknowledged when handled or when they can never succeed; retryable
    /// failures are left pending for redelivery.
    pub async fn run<H>(&self, handler: &H, cancel: CancellationToken)
    where
        H: MessageHandler,
    {
        let sub = &self.subscription;
        tracing::info!(topic = %sub.topic, group = %sub.group, consumer = %sub.consumer, "consumer started");

        while let Err(err) = self.bus.subscribe(&sub.topic, &sub.group).await {
            tracing::warn!(topic = %sub.topic, error = %err, "subscribe failed, retrying");
            if self.pause(&cancel).await {
                return;
            }
        }

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.bus.receive(&sub.topic, &sub.group, &sub.consumer, sub.poll_timeout) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if let Err(err) = self.dispatch(handler, &delivery, &cancel).await {
                        tracing::warn!(topic = %sub.topic, message_id = %delivery.id, error = %err, "ack failed, message will be redelivered");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(topic = %sub.topic, error = %err, "bus read failed, backing off");
                    if self.pause(&cancel).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(topic = %sub.topic, "consumer stopped");
    }

    async fn dispatch<H>(
        &self,
        handler: &H,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<(), BoxError>
    where
        H: MessageHandler,
    {
        let sub = &self.subscription;
        match handler.handle(delivery, cancel).await {
            Ok(()) => {}
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    topic = %sub.topic,
                    message_id = %delivery.id,
                    attempt = delivery.attempt,
                    error = %err,
                    "handler failed, leaving message for redelivery"
                );
                return Ok(());
            }
            Err(err) => {
                tracing::error!(
                    topic = %sub.topic,
                    message_id = %delivery.id,
                    error = %err,
                    "dropping message that cannot be handled"
                );
            }
        }
        self.bus.ack(&sub.topic, &sub.group, &delivery.id).await
    }

    /// Sleep for the backoff; returns true when cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.subscription.backoff) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBus;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    const TOPIC: &str = "audio.processing";
    const GROUP: &str = "audio-processor";

    #[derive(Error, Debug)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("poison")]
        Poison,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    /// Fails according to the payload and records what it saw.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<(Vec<u8>, u32)>>,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        type Error = TestError;

        async fn handle(&self, delivery: &Delivery, _cancel: &CancellationToken) -> Result<(), TestError> {
            self.seen.lock().push((delivery.payload.clone(), delivery.attempt));
            match delivery.payload.as_slice() {
                b"transient" => Err(TestError::Transient),
                b"poison" => Err(TestError::Poison),
                _ => Ok(()),
            }
        }
    }

    fn subscription(backoff: Duration) -> Subscription {
        Subscription {
            topic: TOPIC.to_string(),
            group: GROUP.to_string(),
            consumer: "test".to_string(),
            poll_timeout: Duration::from_millis(10),
            backoff,
        }
    }

    async fn run_until_idle<B: MessageBus>(consumer: &ConsumerLoop<B>, handler: &ScriptedHandler) {
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stopper.cancel();
        });
        consumer.run(handler, cancel).await;
    }

    #[tokio::test]
    async fn test_acks_handled_and_poison_messages() {
        let bus = MemoryBus::new();
        bus.publish(TOPIC, b"1", b"ok").await.unwrap();
        bus.publish(TOPIC, b"2", b"poison").await.unwrap();

        let consumer = ConsumerLoop::new(bus.clone(), subscription(Duration::from_millis(10)));
        let handler = ScriptedHandler::default();
        run_until_idle(&consumer, &handler).await;

        let seen = handler.seen.lock().clone();
        assert_eq!(seen, vec![(b"ok".to_vec(), 1), (b"poison".to_vec(), 1)]);
        assert_eq!(bus.pending_count(TOPIC, GROUP), 0);
        assert_eq!(bus.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_failures_are_redelivered_until_dropped() {
        let bus = MemoryBus::with_redelivery(Duration::ZERO, 3);
        bus.publish(TOPIC, b"1", b"transient").await.unwrap();

        let consumer = ConsumerLoop::new(bus.clone(), subscription(Duration::from_millis(10)));
        let handler = ScriptedHandler::default();
        run_until_idle(&consumer, &handler).await;

        let attempts: Vec<u32> = handler.seen.lock().iter().map(|(_, a)| *a).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(bus.dropped_count(), 1);
    }

    /// Bus whose first reads fail.
    struct FlakyBus {
        inner: MemoryBus,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), BoxError> {
            self.inner.publish(topic, key, payload).await
        }

        async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BoxError> {
            self.inner.subscribe(topic, group).await
        }

        async fn receive(
            &self,
            topic: &str,
            group: &str,
            consumer: &str,
            timeout: Duration,
        ) -> Result<Option<Delivery>, BoxError> {
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err("connection refused".into());
            }
            self.inner.receive(topic, group, consumer, timeout).await
        }

        async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BoxError> {
            self.inner.ack(topic, group, id).await
        }
    }

    #[tokio::test]
    async fn test_survives_bus_errors() {
        let inner = MemoryBus::new();
        inner.publish(TOPIC, b"1", b"ok").await.unwrap();
        let bus = FlakyBus {
            inner: inner.clone(),
            failures_left: AtomicUsize::new(2),
        };

        let consumer = ConsumerLoop::new(bus, subscription(Duration::from_millis(20)));
        let handler = ScriptedHandler::default();
        run_until_idle(&consumer, &handler).await;

        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(inner.pending_count(TOPIC, GROUP), 0);
    }

    #[tokio::test]
    async fn test_stops_during_backoff() {
        let bus = FlakyBus {
            inner: MemoryBus::new(),
            failures_left: AtomicUsize::new(usize::MAX),
        };
        let consumer = ConsumerLoop::new(bus, subscription(Duration::from_secs(3600)));
        let handler = ScriptedHandler::default();

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), consumer.run(&handler, cancel))
            .await
            .unwrap();
    }
}
