use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Object storage behind the media rows. Keys are the `storage_path` column.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, path: &str, mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError>;
    async fn download(&self, path: &str) -> Result<Vec<u8>, MediaStoreError>;
    async fn delete(&self, path: &str) -> Result<(), MediaStoreError>;
}

// ---------------- S3 Implementation (MinIO compatible; ONLY supported backend) ----------------
pub struct S3MediaStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    prefix: String,
}

impl S3MediaStore {
    pub async fn new() -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "clearfeed-media".into());
        let endpoint = std::env::var("S3_ENDPOINT")
            .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
        let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
        let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
        let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));
        loader = loader.endpoint_url(endpoint);
        if !access.is_empty() && !secret.is_empty() {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        // Force path-style addressing (required for most MinIO/local endpoints without wildcard DNS)
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized S3/MinIO client (path-style addressing enabled)");

        // Ensure bucket exists (create if missing)
        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let mut attempt = 0u32;
            let max_attempts = 8;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) => {
                        if attempt >= max_attempts {
                            error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                        }
                        let backoff_ms = 200 * attempt.pow(2); // quadratic backoff
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64))
                            .await;
                    }
                }
            }
        }

        Ok(Self {
            bucket,
            client,
            prefix: "media".into(),
        })
    }

    fn key_for(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn upload(&self, path: &str, mime: &str, bytes: &[u8]) -> Result<(), MediaStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        let key = self.key_for(path);
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(mime);
        if let Err(e) = put.send().await {
            error!(
                "put_object failed path={path} key={key} bucket={} err={:?}",
                self.bucket, e
            );
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(MediaStoreError::Other(format!("{e}{hint}")));
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, MediaStoreError> {
        let key = self.key_for(path);
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|_| MediaStoreError::NotFound)?;
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| MediaStoreError::Other(e.to_string()))?;
        Ok(Vec::from(data.into_bytes().as_ref()))
    }

    async fn delete(&self, path: &str) -> Result<(), MediaStoreError> {
        let key = self.key_for(path);
        // Best-effort delete: treat not found as success
        let _ = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;
        Ok(())
    }
}

// Factory helper used in main (S3-only; panic early if misconfigured)
pub async fn build_media_store() -> Arc<dyn MediaStore> {
    match S3MediaStore::new().await {
        Ok(store) => Arc::new(store),
        Err(e) => panic!("Failed to initialize S3 media store: {e}"),
    }
}
