//! Amazon S3 backend.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

use crate::backend::{validate_key, StorageBackend, StorageError};

pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
}

impl S3Backend {
    pub fn new(
        client: aws_sdk_s3::Client,
        bucket: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            region: region.into(),
        }
    }

    /// Build a client from the default AWS credential chain.
    pub async fn from_env(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;
        Self::new(aws_sdk_s3::Client::new(&sdk_config), bucket, region)
    }

    /// Virtual-hosted style URL of an object.
    pub fn object_url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        )
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::S3(DisplayErrorContext(e).to_string()))?;

        Ok(self.object_url(key))
    }
}
