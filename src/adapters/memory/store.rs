use super::injected;
use crate::domain::range::ByteRange;
use crate::error::BoxError;
use crate::ports::storage::{ObjectBody, ObjectInfo, ObjectStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), StoredObject>,
    failing_uploads: HashSet<String>,
    failing_downloads: HashSet<String>,
    uploads: usize,
}

/// Object store kept in memory, keyed by bucket and object key.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<State>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>, content_type: Option<&str>) {
        self.state.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| object.data.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// Keys stored in a bucket, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state
            .lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of successful uploads so far
    pub fn upload_count(&self) -> usize {
        self.state.lock().uploads
    }

    /// Make every upload to `key` fail
    pub fn fail_upload(&self, key: &str) {
        self.state.lock().failing_uploads.insert(key.to_string());
    }

    /// Make every download of `key` fail
    pub fn fail_download(&self, key: &str) {
        self.state.lock().failing_downloads.insert(key.to_string());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, BoxError> {
        Ok(self
            .state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| ObjectInfo {
                size: object.data.len() as u64,
                content_type: object.content_type.clone(),
            }))
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), BoxError> {
        let data = {
            let state = self.state.lock();
            if state.failing_downloads.contains(key) {
                return Err(injected("download"));
            }
            state
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .map(|object| object.data.clone())
                .ok_or_else(|| format!("no such object: {}/{}", bucket, key))?
        };
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), BoxError> {
        if self.state.lock().failing_uploads.contains(key) {
            return Err(injected("upload"));
        }
        let data = tokio::fs::read(local_path).await?;
        let mut state = self.state.lock();
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: Some(content_type.to_string()),
            },
        );
        state.uploads += 1;
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, BoxError> {
        let Some(data) = self.object(bucket, key) else {
            return Ok(None);
        };
        let data = match range {
            Some(range) => {
                let end = (range.end as usize).min(data.len().saturating_sub(1));
                data.get(range.start as usize..=end)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| format!("range {} outside object {}", range.header_value(), key))?
            }
            None => data,
        };
        Ok(Some(ObjectBody {
            content_length: data.len() as u64,
            reader: Box::pin(Cursor::new(data)),
        }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BoxError> {
        self.state
            .lock()
            .objects
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_ranged_get_returns_slice() {
        let store = MemoryObjectStore::new();
        store.put("audio-tracks", "1/320.mp3", b"0123456789".to_vec(), None);

        let mut body = store
            .get("audio-tracks", "1/320.mp3", Some(ByteRange { start: 2, end: 5 }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.content_length, 4);
        let mut buf = Vec::new();
        body.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"2345");
    }

    #[tokio::test]
    async fn test_download_and_upload_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryObjectStore::new();
        store.put("src", "raw/1.wav", b"pcm".to_vec(), None);

        let local = dir.path().join("nested/1.wav");
        store.download("src", "raw/1.wav", &local).await.unwrap();
        store.upload(&local, "dst", "1/320.mp3", "audio/mpeg").await.unwrap();

        assert_eq!(store.object("dst", "1/320.mp3").unwrap(), b"pcm");
        let info = store.stat("dst", "1/320.mp3").await.unwrap().unwrap();
        assert_eq!(info.content_type.as_deref(), Some("audio/mpeg"));
        assert!(store.stat("dst", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryObjectStore::new();
        store.put("src", "raw/1.wav", b"pcm".to_vec(), None);
        store.fail_download("raw/1.wav");
        store.fail_upload("1/320.mp3");

        let local = dir.path().join("1.wav");
        assert!(store.download("src", "raw/1.wav", &local).await.is_err());
        tokio::fs::write(&local, b"x").await.unwrap();
        assert!(store.upload(&local, "dst", "1/320.mp3", "audio/mpeg").await.is_err());
        assert_eq!(store.upload_count(), 0);
    }
}
