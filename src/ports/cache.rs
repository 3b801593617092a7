use crate::error::BoxError;
use async_trait::async_trait;
use std::time::Duration;

/// Advisory key-value cache with per-key expiration.
///
/// Never authoritative: readers must tolerate stale or missing entries.
#[async_trait]
pub trait StatusCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BoxError>;

    async fn get(&self, key: &str) -> Result<Option<String>, BoxError>;

    async fn delete(&self, key: &str) -> Result<(), BoxError>;

    /// Set one field of a hash and refresh the hash expiration
    async fn set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BoxError>;

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, BoxError>;
}
