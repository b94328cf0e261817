//! Amazon S3 storage backend (requires the `s3` feature).

use aws_sdk_s3::Client;

use crate::error::{ChatGuardError, Result};
use crate::storage::Storage;

/// Storage backend that keeps values as objects in an Amazon S3 (or
/// S3-compatible) bucket, under an optional key prefix.
///
/// # Example
///
/// ```rust,ignore
/// use chat_guard::{S3Storage, Credentials, Region, S3Config};
///
/// let creds = Credentials::new("AKID", "SECRET", None, None, "chat-guard");
/// let config = S3Config::builder()
///     .region(Region::new("eu-west-3"))
///     .credentials_provider(creds)
///     .build();
/// let storage = S3Storage::from_conf(config, "chat-history").with_prefix("tenant-42");
/// ```
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    /// Create a new `S3Storage` with an existing [`Client`] and bucket name.
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: String::new(),
        }
    }

    /// Create an `S3Storage` from an [`aws_sdk_s3::Config`].
    pub fn from_conf(config: aws_sdk_s3::Config, bucket: impl Into<String>) -> Self {
        let client = Client::from_conf(config);
        Self::new(client, bucket)
    }

    /// Create an `S3Storage` using credentials and region from the AWS
    /// environment (env vars, config files, IMDS, etc.).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let client = Client::new(&config);
        Self::new(client, bucket)
    }

    /// Store every key under `prefix/`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }
}

impl Storage for S3Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let object_key = self.object_key(key);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(None);
            }
            Err(e) => return Err(ChatGuardError::Storage(Box::new(e))),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ChatGuardError::Storage(Box::new(e)))?
            .into_bytes();

        let value =
            String::from_utf8(bytes.to_vec()).map_err(|e| ChatGuardError::Storage(Box::new(e)))?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let object_key = self.object_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(value.as_bytes().to_vec().into())
            .content_type("text/plain; charset=utf-8")
            .send()
            .await
            .map_err(|e| ChatGuardError::Storage(Box::new(e)))?;

        tracing::debug!(
            "Uploaded {} bytes to s3://{}/{}",
            value.len(),
            self.bucket,
            object_key
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| ChatGuardError::Storage(Box::new(e)))?;
        Ok(())
    }
}
