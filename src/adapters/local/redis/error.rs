//! Redis error types for the local adapter.

use deadpool_redis::CreatePoolError;
use std::fmt;

pub type RedisError = deadpool_redis::redis::RedisError;
pub type PoolError = deadpool_redis::PoolError;

#[derive(Debug)]
pub enum RedisAdapterError {
    Redis(RedisError),
    Pool(PoolError),
    CreatePool(String),
    /// Stream entry without the expected fields
    MalformedEntry(String),
}

impl fmt::Display for RedisAdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisAdapterError::Redis(e) => write!(f, "Redis error: {}", e),
            RedisAdapterError::Pool(e) => write!(f, "Pool error: {}", e),
            RedisAdapterError::CreatePool(e) => write!(f, "Create pool error: {}", e),
            RedisAdapterError::MalformedEntry(id) => write!(f, "Malformed stream entry: {}", id),
        }
    }
}

impl std::error::Error for RedisAdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RedisAdapterError::Redis(e) => Some(e),
            RedisAdapterError::Pool(e) => Some(e),
            RedisAdapterError::CreatePool(_) | RedisAdapterError::MalformedEntry(_) => None,
        }
    }
}

impl From<RedisError> for RedisAdapterError {
    fn from(err: RedisError) -> Self {
        RedisAdapterError::Redis(err)
    }
}

impl From<PoolError> for RedisAdapterError {
    fn from(err: PoolError) -> Self {
        RedisAdapterError::Pool(err)
    }
}

impl From<CreatePoolError> for RedisAdapterError {
    fn from(err: CreatePoolError) -> Self {
        RedisAdapterError::CreatePool(format!("{}", err))
    }
}
