use crate::domain::range::ByteRange;
use crate::error::BoxError;
use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Reader over an object's bytes.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    pub content_type: Option<String>,
}

/// Object content, possibly limited to a byte range.
pub struct ObjectBody {
    /// Bytes the reader will yield
    pub content_length: u64,
    pub reader: ObjectReader,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object metadata, `None` when the object does not exist
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, BoxError>;

    /// Download an object to a local path
    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), BoxError>;

    /// Upload a file from a local path to storage
    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), BoxError>;

    /// Open an object for reading, optionally limited to a range.
    /// Returns `None` when the object does not exist.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, BoxError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BoxError>;
}
