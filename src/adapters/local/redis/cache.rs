//! Redis StatusCache implementation.

use super::error::RedisAdapterError;
use super::pool::RedisPool;
use crate::error::BoxError;
use crate::ports::cache::StatusCache;
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use std::time::Duration;

/// Redis rejects a zero expiry.
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl StatusCache for RedisPool {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BoxError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(key, value, expiry_secs(ttl))
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await.map_err(RedisAdapterError::from)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }

    async fn set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BoxError> {
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .ignore()
            .expire(key, expiry_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, BoxError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(key, field)
            .await
            .map_err(RedisAdapterError::from)?;
        Ok(value)
    }
}
