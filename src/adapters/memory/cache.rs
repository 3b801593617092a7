use super::injected;
use crate::error::BoxError;
use crate::ports::cache::StatusCache;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// Expiring key-value cache kept in memory.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until turned off again
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Remaining lifetime of a live key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .and_then(|entry| entry.expires_at.checked_duration_since(Instant::now()))
    }

    fn check(&self) -> Result<(), BoxError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected("cache"));
        }
        Ok(())
    }
}

fn live(entries: &mut HashMap<String, Entry>, key: &str) -> Option<Value> {
    if entries.get(key)?.expires_at <= Instant::now() {
        entries.remove(key);
        return None;
    }
    entries.get(key).map(|entry| match &entry.value {
        Value::Text(text) => Value::Text(text.clone()),
        Value::Hash(hash) => Value::Hash(hash.clone()),
    })
}

#[async_trait]
impl StatusCache for MemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BoxError> {
        self.check()?;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BoxError> {
        self.check()?;
        match live(&mut self.entries.lock(), key) {
            Some(Value::Text(text)) => Ok(Some(text)),
            Some(Value::Hash(_)) => Err(format!("{} holds a hash", key).into()),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), BoxError> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn set_field(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BoxError> {
        self.check()?;
        let mut entries = self.entries.lock();
        let mut hash = match live(&mut entries, key) {
            Some(Value::Hash(hash)) => hash,
            Some(Value::Text(_)) => return Err(format!("{} holds a string", key).into()),
            None => HashMap::new(),
        };
        hash.insert(field.to_string(), value.to_string());
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(hash),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_field(&self, key: &str, field: &str) -> Result<Option<String>, BoxError> {
        self.check()?;
        match live(&mut self.entries.lock(), key) {
            Some(Value::Hash(mut hash)) => Ok(hash.remove(field)),
            Some(Value::Text(_)) => Err(format!("{} holds a string", key).into()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.ttl("a").is_none());
    }

    #[tokio::test]
    async fn test_hash_fields_refresh_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_field("session:s:pos", "position", "12.5", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            cache.get_field("session:s:pos", "position").await.unwrap().as_deref(),
            Some("12.5")
        );
        assert!(cache.get_field("session:s:pos", "other").await.unwrap().is_none());
        assert!(cache.ttl("session:s:pos").unwrap() > Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn test_failing_cache() {
        let cache = MemoryCache::new();
        cache.set_failing(true);
        assert!(cache.set("a", "1", Duration::from_secs(1)).await.is_err());
        cache.set_failing(false);
        assert!(cache.get("a").await.unwrap().is_none());
    }
}
