//! Redis Streams MessageBus implementation.
//!
//! Each topic is a stream; entries carry the message key and payload as fields. Consumer groups
//! give at-least-once delivery: entries stay pending until acknowledged, and pending entries idle
//! longer than the redelivery delay are claimed by the next reader.

use super::error::RedisAdapterError;
use super::pool::RedisPool;
use super::{KEY_FIELD, VALUE_FIELD};
use crate::error::BoxError;
use crate::ports::bus::{Delivery, MessageBus};
use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{AsyncCommands, RedisResult};
use std::time::Duration;

/// Pending entries examined per read.
const PENDING_SCAN: usize = 10;

#[derive(Clone)]
pub struct RedisBus {
    pool: RedisPool,
    redeliver_after: Duration,
    max_deliveries: u32,
}

impl RedisBus {
    pub fn new(pool: RedisPool, redeliver_after: Duration, max_deliveries: u32) -> Self {
        Self {
            pool,
            redeliver_after,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Claim the oldest pending entry that has waited long enough, dropping exhausted ones.
    async fn claim_stale(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<Delivery>, BoxError> {
        let mut conn = self.pool.connection().await?;
        let pending: StreamPendingCountReply = conn
            .xpending_count(topic, group, "-", "+", PENDING_SCAN)
            .await
            .map_err(RedisAdapterError::from)?;

        let min_idle = self.redeliver_after.as_millis() as usize;
        for entry in pending.ids {
            if entry.last_delivered_ms < min_idle {
                continue;
            }
            if entry.times_delivered as u32 >= self.max_deliveries {
                tracing::error!(
                    topic,
                    group,
                    message_id = %entry.id,
                    deliveries = entry.times_delivered,
                    "message exceeded its deliveries, dropping"
                );
                let _: i64 = conn
                    .xack(topic, group, &[&entry.id])
                    .await
                    .map_err(RedisAdapterError::from)?;
                continue;
            }

            let claimed: StreamClaimReply = conn
                .xclaim(topic, group, consumer, min_idle, &[&entry.id])
                .await
                .map_err(RedisAdapterError::from)?;
            // Another consumer may have claimed it first.
            if let Some(stream_id) = claimed.ids.first() {
                let attempt = entry.times_delivered as u32 + 1;
                return Ok(Some(to_delivery(stream_id, attempt)?));
            }
        }
        Ok(None)
    }
}

/// Convert a stream entry into a delivery.
fn to_delivery(entry: &StreamId, attempt: u32) -> Result<Delivery, RedisAdapterError> {
    let payload: Vec<u8> = entry
        .get(VALUE_FIELD)
        .ok_or_else(|| RedisAdapterError::MalformedEntry(entry.id.clone()))?;
    let key: Vec<u8> = entry.get(KEY_FIELD).unwrap_or_default();
    Ok(Delivery {
        id: entry.id.clone(),
        key,
        payload,
        attempt,
    })
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, key: &[u8], payload: &[u8]) -> Result<(), BoxError> {
        let mut conn = self.pool.connection().await?;
        let _: String = conn
            .xadd(topic, "*", &[(KEY_FIELD, key), (VALUE_FIELD, payload)])
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), BoxError> {
        let mut conn = self.pool.connection().await?;
        // Start from the beginning so messages published before the first subscriber are kept.
        let created: RedisResult<()> = conn.xgroup_create_mkstream(topic, group, "0").await;
        match created {
            Ok(()) => {
                tracing::info!(topic, group, "created consumer group");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(RedisAdapterError::from(err).into()),
        }
    }

    async fn receive(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BoxError> {
        if let Some(delivery) = self.claim_stale(topic, group, consumer).await? {
            return Ok(Some(delivery));
        }

        let mut options = StreamReadOptions::default().group(group, consumer).count(1);
        // BLOCK 0 would wait forever.
        if !timeout.is_zero() {
            options = options.block(timeout.as_millis().max(1) as usize);
        }

        let mut conn = self.pool.connection().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topic], &[">"], &options)
            .await
            .map_err(RedisAdapterError::from)?;

        let entry = reply
            .into_iter()
            .flat_map(|reply| reply.keys)
            .flat_map(|stream| stream.ids)
            .next();
        match entry {
            Some(entry) => Ok(Some(to_delivery(&entry, 1)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), BoxError> {
        let mut conn = self.pool.connection().await?;
        let _: i64 = conn
            .xack(topic, group, &[id])
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }
}
