//! Local adapters: filesystem object store and Redis bus/cache.

pub mod fs;
pub mod redis;

pub use fs::FsObjectStore;
pub use redis::{RedisBus, RedisPool};
