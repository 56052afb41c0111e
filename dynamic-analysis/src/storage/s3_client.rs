/// S3-compatible object storage for analysis artifacts
///
/// Works against AWS S3 and compatible services (MinIO, R2, ...). Credentials
/// and region come from the standard AWS environment chain; an explicit
/// endpoint switches to path-style addressing.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shared::crypto::sha256;
use tracing::{debug, info};

use super::{object_name, ArtifactCategory, ResultStore};
use crate::error::StorageError;
use crate::models::Package;

/// S3 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix inside the bucket, without leading or trailing '/'
    pub prefix: String,
    /// Uses the SDK default chain when unset
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub max_object_size_mb: u64,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            region: None,
            endpoint: None,
            path_style: false,
            max_object_size_mb: 500,
        }
    }

    /// Bucket and prefix from the store URI, endpoint overrides from
    /// `S3_ENDPOINT` and `S3_FORCE_PATH_STYLE`
    pub fn from_env(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        let mut config = Self::new(bucket, prefix);
        config.endpoint = std::env::var("S3_ENDPOINT").ok().filter(|v| !v.trim().is_empty());
        config.path_style = match std::env::var("S3_FORCE_PATH_STYLE") {
            Ok(value) => matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => config.endpoint.is_some(),
        };
        config
    }

    /// Full object key for an artifact
    pub fn key_for(&self, category: ArtifactCategory, package: &Package) -> String {
        let name = object_name(category, package);
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

pub struct S3ResultStore {
    client: Client,
    config: S3Config,
}

impl S3ResultStore {
    pub async fn new(config: S3Config) -> Self {
        info!("Initializing S3 result store for bucket: {}", config.bucket);

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        if config.path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config.build()),
            config,
        }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }
}

#[async_trait]
impl ResultStore for S3ResultStore {
    async fn save(&self, category: ArtifactCategory, package: &Package, data: Bytes) -> Result<String, StorageError> {
        let size_mb = data.len() as u64 / (1024 * 1024);
        if size_mb > self.config.max_object_size_mb {
            return Err(StorageError::UploadError(format!(
                "object size {} MB exceeds limit of {} MB",
                size_mb, self.config.max_object_size_mb
            )));
        }

        let key = self.config.key_for(category, package);
        let digest = sha256(&data);
        debug!(category = %category, bytes = data.len(), "Uploading s3://{}/{}", self.config.bucket, key);

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_type(category.content_type())
            .metadata("sha256", digest)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::UploadError(format!("S3 put failed for {}: {}", key, e)))?;

        Ok(format!("s3://{}/{}", self.config.bucket, key))
    }
}
