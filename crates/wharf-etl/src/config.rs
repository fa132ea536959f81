//! Configuration management
//!
//! Everything is read from environment variables (after loading `.env`),
//! falling back to the defaults below, then validated once.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::{
    PipelineSettings, DEFAULT_CHUNK_ATTEMPTS, DEFAULT_CHUNK_CONCURRENCY, DEFAULT_CHUNK_THRESHOLD,
};
use crate::auth::{AccessTokenProvider, ServiceAccountTokens, StaticToken};
use crate::secrets::{EnvSecretStore, FileSecretStore, SecretStore};
use crate::sink::{
    BigQueryClient, BigQueryConfig, DEFAULT_API_BASE, DEFAULT_JOB_PROJECT, DEFAULT_LOCATION,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_UPLOAD_BASE,
};
use crate::storage::{LocalStore, ObjectStore, S3Storage, StorageConfig};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default directory holding `<secret id>.json` files.
pub const DEFAULT_SECRETS_DIR: &str = "./secrets";

/// Default logical secret id for the source database.
pub const DEFAULT_SECRET_ID: &str = "mysql-source";

/// Default source connect timeout in seconds.
pub const DEFAULT_SOURCE_CONNECT_TIMEOUT_SECS: u64 = 500;

/// Default staging bucket.
pub const DEFAULT_STAGING_BUCKET: &str = "etl-raw-data";

/// Default root directory for local staging.
pub const DEFAULT_STAGING_DIR: &str = "./staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    File,
    Env,
}

impl FromStr for SecretBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "file" => Ok(SecretBackend::File),
            "env" => Ok(SecretBackend::Env),
            other => anyhow::bail!("Invalid secret backend '{}': expected 'file' or 'env'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingBackend {
    S3,
    Local,
}

impl FromStr for StagingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StagingBackend::S3),
            "local" => Ok(StagingBackend::Local),
            other => anyhow::bail!("Invalid staging backend '{}': expected 's3' or 'local'", other),
        }
    }
}

/// ETL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub secrets: SecretsConfig,
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub staging: StagingConfig,
    pub bigquery: BigQuerySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    pub backend: SecretBackend,
    pub dir: PathBuf,
    pub secret_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunk_threshold: u64,
    pub chunk_concurrency: usize,
    pub chunk_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    pub backend: StagingBackend,
    pub bucket: String,
    pub dir: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BigQuerySettings {
    pub api_base: String,
    pub upload_base: String,
    pub job_project: String,
    /// Service-account key file; preferred over `access_token`
    pub key_path: Option<PathBuf>,
    /// Pre-minted token for short runs without a key file
    pub access_token: Option<String>,
    pub location: String,
    pub poll_interval_ms: u64,
}

impl std::fmt::Debug for BigQuerySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQuerySettings")
            .field("api_base", &self.api_base)
            .field("upload_base", &self.upload_base)
            .field("job_project", &self.job_project)
            .field("key_path", &self.key_path)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("location", &self.location)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

fn parsed<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e)),
        None => Ok(default),
    }
}

impl EtlConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let config = EtlConfig {
            secrets: SecretsConfig {
                backend: parsed(&lookup, "WHARF_SECRET_BACKEND", SecretBackend::File)?,
                dir: PathBuf::from(text("WHARF_SECRETS_DIR", DEFAULT_SECRETS_DIR)),
                secret_id: text("WHARF_SECRET_ID", DEFAULT_SECRET_ID),
            },
            source: SourceConfig {
                connect_timeout_secs: parsed(
                    &lookup,
                    "WHARF_SOURCE_CONNECT_TIMEOUT_SECS",
                    DEFAULT_SOURCE_CONNECT_TIMEOUT_SECS,
                )?,
            },
            pipeline: PipelineConfig {
                chunk_threshold: parsed(&lookup, "WHARF_CHUNK_THRESHOLD", DEFAULT_CHUNK_THRESHOLD)?,
                chunk_concurrency: parsed(
                    &lookup,
                    "WHARF_CHUNK_CONCURRENCY",
                    DEFAULT_CHUNK_CONCURRENCY,
                )?,
                chunk_attempts: parsed(&lookup, "WHARF_CHUNK_ATTEMPTS", DEFAULT_CHUNK_ATTEMPTS)?,
            },
            staging: StagingConfig {
                backend: parsed(&lookup, "WHARF_STAGING_BACKEND", StagingBackend::S3)?,
                bucket: text("WHARF_STAGING_BUCKET", DEFAULT_STAGING_BUCKET),
                dir: PathBuf::from(text("WHARF_STAGING_DIR", DEFAULT_STAGING_DIR)),
            },
            bigquery: BigQuerySettings {
                api_base: text("BIGQUERY_API_BASE", DEFAULT_API_BASE),
                upload_base: text("BIGQUERY_UPLOAD_BASE", DEFAULT_UPLOAD_BASE),
                job_project: text("BIGQUERY_PROJECT", DEFAULT_JOB_PROJECT),
                key_path: lookup("BIGQUERY_KEY_PATH")
                    .filter(|p| !p.trim().is_empty())
                    .map(PathBuf::from),
                access_token: lookup("BIGQUERY_ACCESS_TOKEN").filter(|t| !t.trim().is_empty()),
                location: text("BIGQUERY_LOCATION", DEFAULT_LOCATION),
                poll_interval_ms: parsed(
                    &lookup,
                    "BIGQUERY_POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )?,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.secrets.secret_id.trim().is_empty() {
            anyhow::bail!("Secret id cannot be empty");
        }

        if self.source.connect_timeout_secs == 0 {
            anyhow::bail!("Source connect timeout must be greater than 0");
        }

        if self.pipeline.chunk_threshold == 0 {
            anyhow::bail!("Chunk threshold must be greater than 0");
        }

        if self.pipeline.chunk_concurrency == 0 {
            anyhow::bail!("Chunk concurrency must be greater than 0");
        }

        if self.pipeline.chunk_attempts == 0 {
            anyhow::bail!("Chunk attempts must be greater than 0");
        }

        if self.staging.bucket.trim().is_empty() {
            anyhow::bail!("Staging bucket cannot be empty");
        }

        for base in [&self.bigquery.api_base, &self.bigquery.upload_base] {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                anyhow::bail!("BigQuery API base must be an http(s) URL: {}", base);
            }
        }

        if self.bigquery.location.trim().is_empty() {
            anyhow::bail!("BigQuery location cannot be empty");
        }

        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            chunk_threshold: self.pipeline.chunk_threshold,
            chunk_concurrency: self.pipeline.chunk_concurrency,
            chunk_attempts: self.pipeline.chunk_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.source.connect_timeout_secs)
    }

    /// Warehouse client settings
    pub fn bigquery_config(&self) -> BigQueryConfig {
        BigQueryConfig {
            api_base: self.bigquery.api_base.clone(),
            upload_base: self.bigquery.upload_base.clone(),
            job_project: self.bigquery.job_project.clone(),
            location: self.bigquery.location.clone(),
            poll_interval: Duration::from_millis(self.bigquery.poll_interval_ms),
            ..BigQueryConfig::default()
        }
    }

    /// Warehouse credentials: the key file if set, else the static token
    pub async fn token_provider(&self) -> anyhow::Result<Arc<dyn AccessTokenProvider>> {
        if let Some(path) = &self.bigquery.key_path {
            let tokens = ServiceAccountTokens::from_key_file(path).await?;
            return Ok(Arc::new(tokens));
        }

        let token = self
            .bigquery
            .access_token
            .clone()
            .context("BIGQUERY_KEY_PATH or BIGQUERY_ACCESS_TOKEN must be set to talk to the warehouse")?;
        Ok(Arc::new(StaticToken::new(token)))
    }

    pub async fn bigquery_client(&self) -> anyhow::Result<BigQueryClient> {
        let tokens = self.token_provider().await?;
        Ok(BigQueryClient::new(self.bigquery_config(), tokens)?)
    }

    pub fn secret_store(&self) -> Arc<dyn SecretStore> {
        match self.secrets.backend {
            SecretBackend::File => Arc::new(FileSecretStore::new(&self.secrets.dir)),
            SecretBackend::Env => Arc::new(EnvSecretStore::new()),
        }
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        match self.staging.backend {
            StagingBackend::S3 => {
                Arc::new(S3Storage::new(StorageConfig::from_env(self.staging.bucket.clone())))
            },
            StagingBackend::Local => {
                Arc::new(LocalStore::new(&self.staging.dir, self.staging.bucket.clone()))
            },
        }
    }
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            secrets: SecretsConfig {
                backend: SecretBackend::File,
                dir: PathBuf::from(DEFAULT_SECRETS_DIR),
                secret_id: DEFAULT_SECRET_ID.to_string(),
            },
            source: SourceConfig {
                connect_timeout_secs: DEFAULT_SOURCE_CONNECT_TIMEOUT_SECS,
            },
            pipeline: PipelineConfig {
                chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
                chunk_concurrency: DEFAULT_CHUNK_CONCURRENCY,
                chunk_attempts: DEFAULT_CHUNK_ATTEMPTS,
            },
            staging: StagingConfig {
                backend: StagingBackend::S3,
                bucket: DEFAULT_STAGING_BUCKET.to_string(),
                dir: PathBuf::from(DEFAULT_STAGING_DIR),
            },
            bigquery: BigQuerySettings {
                api_base: DEFAULT_API_BASE.to_string(),
                upload_base: DEFAULT_UPLOAD_BASE.to_string(),
                job_project: DEFAULT_JOB_PROJECT.to_string(),
                key_path: None,
                access_token: None,
                location: DEFAULT_LOCATION.to_string(),
                poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            },
        }
    }
}
