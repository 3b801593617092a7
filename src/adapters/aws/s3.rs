use crate::domain::range::ByteRange;
use crate::error::BoxError;
use crate::ports::storage::{ObjectBody, ObjectInfo, ObjectStore};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::path::Path;

/// S3ObjectStore implements ObjectStore for S3 and S3-compatible services (MinIO).
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the shared AWS config, optionally against a custom endpoint.
    pub fn from_config(shared: &aws_config::SdkConfig, endpoint: Option<&str>) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(shared);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, BoxError> {
        let resp = self.client.head_object().bucket(bucket).key(key).send().await;
        match resp {
            Ok(head) => Ok(Some(ObjectInfo {
                size: head.content_length().unwrap_or(0).max(0) as u64,
                content_type: head.content_type().map(str::to_string),
            })),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), BoxError> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;

        let mut reader = resp.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        Ok(())
    }

    async fn upload(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<(), BoxError> {
        let body = ByteStream::from_path(local_path).await?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await?;
        Ok(())
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Option<ObjectBody>, BoxError> {
        let mut request = self.client.get_object().bucket(bucket).key(key);
        if let Some(range) = range {
            request = request.range(range.header_value());
        }

        match request.send().await {
            Ok(resp) => Ok(Some(ObjectBody {
                content_length: resp.content_length().unwrap_or(0).max(0) as u64,
                reader: Box::pin(resp.body.into_async_read()),
            })),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BoxError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}
