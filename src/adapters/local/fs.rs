use crate::domain::quality;
use crate::domain::range::ByteRange;
use crate::error::BoxError;
use crate::ports::storage::{ObjectBody, ObjectInfo, ObjectStore};
use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Object store over a directory tree: one directory per bucket under `root`.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a bucket/key pair to a path, refusing anything that escapes the bucket.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, BoxError> {
        let relative = Path::new(key);
        let safe = !bucket.is_empty()
            && !bucket.contains(['/', '\\'])
            && bucket != ".."
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe || key.is_empty() {
            return Err(format!("invalid object key {}/{}", bucket, key).into());
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

async fn metadata(path: &Path) -> Result<Option<std::fs::Metadata>, BoxError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta)),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, BoxError> {
        let path = self.object_path(bucket, key)?;
        Ok(metadata(&path).await?.map(|meta| ObjectInfo {
            size: meta.len(),
            content_type: path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| quality::content_type_for(ext).to_string()),
        }))
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), BoxError> {
        let path = self.object_path(bucket, key)?;
        if path != local_path {
            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&path, local_path).await?;
        }
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        _content_type: &str,
    ) -> Result<(), BoxError> {
        let path = self.object_path(bucket, key)?;
        if path != local_path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(local_path, &path).await?;
        }
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, BoxError> {
        let path = self.object_path(bucket, key)?;
        let Some(meta) = metadata(&path).await? else {
            return Ok(None);
        };
        let mut file = tokio::fs::File::open(&path).await?;
        let body = match range {
            Some(range) => {
                let end = range.end.min(meta.len().saturating_sub(1));
                let length = end.saturating_sub(range.start) + 1;
                file.seek(SeekFrom::Start(range.start)).await?;
                ObjectBody {
                    content_length: length,
                    reader: Box::pin(file.take(length)),
                }
            }
            None => ObjectBody {
                content_length: meta.len(),
                reader: Box::pin(file),
            },
        };
        Ok(Some(body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BoxError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
