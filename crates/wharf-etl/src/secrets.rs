//! Source credentials and the stores that resolve them
//!
//! A logical secret id resolves to `HOST`, `PORT`, `USER`, `PASSWORD` and
//! `DATABASE`. `PORT` is accepted either as a JSON number or as a string.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use crate::error::{EtlError, Result};

/// Connection parameters for the source database
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct SourceCredentials {
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let port = match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => u16::try_from(n).map_err(serde::de::Error::custom)?,
        PortValue::Text(s) => s.trim().parse::<u16>().map_err(serde::de::Error::custom)?,
    };
    Ok(port)
}

/// Resolves a logical secret id into source credentials
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn source_credentials(&self, secret_id: &str) -> Result<SourceCredentials>;
}

/// Reads `<dir>/<secret_id>.json`
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    #[instrument(skip(self))]
    async fn source_credentials(&self, secret_id: &str) -> Result<SourceCredentials> {
        let path = self.dir.join(format!("{}.json", secret_id));
        debug!("Reading secret from {}", path.display());

        let secret_err = |message: String| EtlError::Secret {
            secret_id: secret_id.to_string(),
            message,
        };

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| secret_err(format!("cannot read {}: {}", path.display(), e)))?;

        serde_json::from_str(&raw).map_err(|e| secret_err(format!("malformed secret: {}", e)))
    }
}

/// Reads `<ID>_HOST`, `<ID>_PORT`, ... from the process environment.
///
/// The id is upper-cased and `-` becomes `_`, so `mysql-source` reads
/// `MYSQL_SOURCE_HOST`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn new() -> Self {
        Self
    }

    fn resolve<F>(secret_id: &str, lookup: F) -> Result<SourceCredentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = secret_id.to_uppercase().replace('-', "_");
        let var = |field: &str| {
            let name = format!("{}_{}", prefix, field);
            lookup(&name).ok_or_else(|| EtlError::Secret {
                secret_id: secret_id.to_string(),
                message: format!("{} is not set", name),
            })
        };

        let port_raw = var("PORT")?;
        let port = port_raw.trim().parse::<u16>().map_err(|e| EtlError::Secret {
            secret_id: secret_id.to_string(),
            message: format!("invalid port '{}': {}", port_raw, e),
        })?;

        Ok(SourceCredentials {
            host: var("HOST")?,
            port,
            user: var("USER")?,
            password: var("PASSWORD")?,
            database: var("DATABASE")?,
        })
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn source_credentials(&self, secret_id: &str) -> Result<SourceCredentials> {
        Self::resolve(secret_id, |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_accepts_numeric_and_string_port() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("numeric.json"),
            r#"{"HOST":"db","PORT":3306,"USER":"etl","PASSWORD":"pw","DATABASE":"default_db"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("text.json"),
            r#"{"HOST":"db","PORT":"3307","USER":"etl","PASSWORD":"pw","DATABASE":"default_db"}"#,
        )
        .unwrap();

        let store = FileSecretStore::new(dir.path());
        assert_eq!(store.source_credentials("numeric").await.unwrap().port, 3306);
        assert_eq!(store.source_credentials("text").await.unwrap().port, 3307);
    }

    #[tokio::test]
    async fn test_file_store_missing_and_malformed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), r#"{"HOST":"db","PORT":"abc"}"#).unwrap();

        let store = FileSecretStore::new(dir.path());
        let missing = store.source_credentials("absent").await.unwrap_err();
        assert!(matches!(missing, EtlError::Secret { .. }));
        assert!(store.source_credentials("bad").await.is_err());
    }

    #[test]
    fn test_env_store_maps_secret_id_to_prefix() {
        let vars: HashMap<&str, &str> = [
            ("MYSQL_SOURCE_HOST", "db"),
            ("MYSQL_SOURCE_PORT", "3306"),
            ("MYSQL_SOURCE_USER", "etl"),
            ("MYSQL_SOURCE_PASSWORD", "pw"),
            ("MYSQL_SOURCE_DATABASE", "default_db"),
        ]
        .into_iter()
        .collect();

        let creds =
            EnvSecretStore::resolve("mysql-source", |name| vars.get(name).map(|v| v.to_string()))
                .unwrap();
        assert_eq!(creds.host, "db");
        assert_eq!(creds.port, 3306);

        let err = EnvSecretStore::resolve("other", |_| None).unwrap_err();
        assert!(err.to_string().contains("OTHER_PORT"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = SourceCredentials {
            host: "db".into(),
            port: 3306,
            user: "etl".into(),
            password: "hunter2".into(),
            database: "default_db".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
