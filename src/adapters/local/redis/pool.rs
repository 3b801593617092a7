//! Redis connection pool.

use super::bus::RedisBus;
use super::error::RedisAdapterError;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use std::time::Duration;

/// Redis-backed adapter for the status cache, and the source of [`RedisBus`] handles.
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Create a new RedisPool with connection pool.
    pub fn new(redis_url: &str) -> Result<Self, RedisAdapterError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    /// Message bus over Redis Streams sharing this pool.
    pub fn bus(&self, redeliver_after: Duration, max_deliveries: u32) -> RedisBus {
        RedisBus::new(self.clone(), redeliver_after, max_deliveries)
    }

    pub(super) async fn connection(&self) -> Result<Connection, RedisAdapterError> {
        Ok(self.pool.get().await?)
    }
}
