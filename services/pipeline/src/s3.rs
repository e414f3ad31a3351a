//! Frames and videos in an S3-compatible bucket.

use crate::config::S3Config;
use crate::storage::{frame_reference, video_reference, FrameStore, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

/// Object-store backend; references are object keys in one bucket
pub struct S3FrameStore {
    client: S3Client,
    bucket: String,
}

fn content_type(reference: &str) -> &'static str {
    match reference.rsplit('.').next().map(str::to_lowercase).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

impl S3FrameStore {
    pub async fn new(config: &S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::Backend("S3 bucket is not configured".to_string()));
        }

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // MinIO / LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 frame store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(content_type(key))
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("put {}: {}", key, e)))?;

        debug!(key = %key, size_bytes = bytes.len(), "Object uploaded");
        Ok(())
    }
}

#[async_trait]
impl FrameStore for S3FrameStore {
    #[instrument(skip(self, bytes), fields(bucket = %self.bucket))]
    async fn save_frame(&self, video_id: &str, index: u64, bytes: &[u8]) -> Result<String, StorageError> {
        let key = frame_reference(video_id, index);
        self.put(&key, bytes).await?;
        Ok(key)
    }

    async fn save_video(&self, video_id: &str, bytes: &[u8]) -> Result<String, StorageError> {
        let key = video_reference(video_id);
        self.put(&key, bytes).await?;
        Ok(key)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound(reference.to_string()));
                }
                return Err(StorageError::Backend(format!("get {}: {}", reference, e)));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Backend(format!("read body of {}: {}", reference, e)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
        {
            Ok(_) => {}
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound(reference.to_string()));
                }
                return Err(StorageError::Backend(format!("head {}: {}", reference, e)));
            }
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(reference)
            .send()
            .await
            .map_err(|e| StorageError::Backend(format!("delete {}: {}", reference, e)))?;

        debug!(key = %reference, "Object deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("frames/v/0.jpg"), "image/jpeg");
        assert_eq!(content_type("videos/v.MP4"), "video/mp4");
        assert_eq!(content_type("blob"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_bucket_required() {
        let result = S3FrameStore::new(&S3Config::default()).await;
        assert!(matches!(result, Err(StorageError::Backend(_))));
    }
}
