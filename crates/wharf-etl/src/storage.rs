//! Object storage for staged chunk files
//!
//! [`S3Storage`] talks to any S3-compatible endpoint: AWS, MinIO, or GCS in
//! interoperability mode. [`LocalStore`] keeps objects on the local
//! filesystem, writing through a temp file so readers never see a partial
//! object.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use wharf_common::checksum::sha256_hex;

const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_S3_ACCESS_KEY: &str = "minioadmin";

/// Result of a successful object write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub key: String,
    pub checksum: String,
    pub size: u64,
}

/// Whole-object store addressed by key within one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Write `data` as one whole object
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> anyhow::Result<PutResult>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

// ============================================================================
// S3-compatible storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    /// Read `S3_*` variables; the bucket comes from the staging settings
    pub fn from_env(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok(),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_S3_REGION.to_string()),
            bucket: bucket.into(),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_else(|_| DEFAULT_S3_ACCESS_KEY.to_string()),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_else(|_| DEFAULT_S3_ACCESS_KEY.to_string()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }
}

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(config: StorageConfig) -> Self {
        debug!(
            "Initializing staging storage (endpoint: {:?}, region: {})",
            config.endpoint, config.region
        );

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "wharf-staging",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Staging storage initialized for bucket: {}", config.bucket);

        Self {
            client,
            bucket: config.bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, data))]
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> anyhow::Result<PutResult> {
        let checksum = sha256_hex(&data);
        let size = data.len() as u64;

        debug!("Uploading {} bytes to s3://{}/{}", size, self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .context("Failed to upload to S3")?;

        info!("Successfully uploaded to s3://{}/{}", self.bucket, key);

        Ok(PutResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }

    #[instrument(skip(self))]
    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!("Failed to check S3 object existence: {}", service_err))
                }
            },
        }
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        debug!("Downloading from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);

        Ok(data)
    }
}

// ============================================================================
// Local filesystem storage
// ============================================================================

/// Objects live at `<root>/<bucket>/<key>`
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    bucket: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    fn object_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(anyhow!("Invalid object key: {}", key));
        }
        Ok(self.root.join(&self.bucket).join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, data))]
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> anyhow::Result<PutResult> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let checksum = sha256_hex(&data);
        let size = data.len() as u64;

        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move {} into place", path.display()))?;

        debug!("Wrote {} bytes to {}", size, path.display());

        Ok(PutResult {
            key: key.to_string(),
            checksum,
            size,
        })
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.object_path(key)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.object_path(key)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    #[serial_test::serial]
    fn test_storage_config_from_env() {
        env::set_var("S3_ENDPOINT", "http://localhost:9000");
        env::set_var("S3_PATH_STYLE", "true");
        env::remove_var("S3_ACCESS_KEY");
        env::remove_var("AWS_ACCESS_KEY_ID");

        let config = StorageConfig::from_env("etl-raw-data");

        env::remove_var("S3_ENDPOINT");
        env::remove_var("S3_PATH_STYLE");

        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "etl-raw-data");
        assert_eq!(config.access_key, "minioadmin");
        assert!(config.path_style);
    }

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path(), "etl-raw-data");
        let key = "dev/table_one/year=2023/month=8/day=28/table_one_x.csv";

        assert!(!store.exists(key).await.unwrap());
        let result = store.put(key, b"id\n1\n".to_vec(), "text/csv").await.unwrap();
        assert_eq!(result.size, 5);
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get(key).await.unwrap(), b"id\n1\n");
        assert!(dir.path().join("etl-raw-data").join(key).is_file());
    }

    #[tokio::test]
    async fn test_local_store_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path(), "b");
        store.put("a/obj.csv", b"x".to_vec(), "text/csv").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("b").join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["obj.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_local_store_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::new(dir.path(), "b");
        assert!(store.put("../outside.csv", vec![], "text/csv").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }
}
