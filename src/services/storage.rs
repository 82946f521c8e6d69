use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::future::Future;
use std::time::Duration;

/// Bytes read back from object storage.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<StoredObject, StorageError>;

    /// Public URL a client can load the object from.
    fn public_url(&self, key: &str) -> String;
}

/// Object keys for one bookmark's archived content.
pub struct SnapshotKeys {
    pub page: String,
    pub thumbnail: String,
}

impl SnapshotKeys {
    pub fn new(owner_id: &str, bookmark_id: &str) -> Self {
        let dir = format!("snapshots/{owner_id}/{bookmark_id}");
        Self {
            page: format!("{dir}/page.html"),
            thumbnail: format!("{dir}/thumbnail.jpg"),
        }
    }
}

/// Client for S3-compatible object storage (R2, MinIO, S3).
pub struct S3Storage {
    bucket: Box<Bucket>,
    public_base_url: String,
    timeout: Duration,
}

impl S3Storage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    async fn timed<T, F>(&self, key: &str, op: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, s3::error::S3Error>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result.map_err(StorageError::S3),
            Err(_) => Err(StorageError::Timeout {
                key: key.to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .timed(key, self.bucket.put_object_with_content_type(key, data, content_type))
            .await?;
        check_status(key, response.status_code())
    }

    async fn download(&self, key: &str) -> Result<StoredObject, StorageError> {
        let response = self.timed(key, self.bucket.get_object(key)).await?;
        check_status(key, response.status_code())?;

        let content_type = response
            .headers()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone());

        Ok(StoredObject {
            bytes: response.to_vec(),
            content_type,
        })
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

fn check_status(key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        _ => Err(StorageError::Status {
            key: key.to_string(),
            status,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object storage returned HTTP {status} for {key}")]
    Status { key: String, status: u16 },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object storage call for {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
