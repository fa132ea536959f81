//! Warehouse credentials
//!
//! The REST client asks an [`AccessTokenProvider`] for a bearer token on
//! every request. A service-account key refreshes its tokens before they
//! expire, so long loads outlive any single token.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::ServiceAccountAuthenticator;

use crate::error::{EtlError, Result, System};

/// OAuth scope covering jobs and table data
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Supplies the bearer token for the next request
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A pre-minted token, e.g. from `gcloud auth print-access-token`
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// Tokens minted from a service-account key file, cached until near expiry
pub struct ServiceAccountTokens {
    auth: DefaultAuthenticator,
}

impl ServiceAccountTokens {
    pub async fn from_key_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let key = yup_oauth2::read_service_account_key(path).await.map_err(|e| {
            EtlError::Config(format!(
                "cannot read service account key '{}': {}",
                path.display(),
                e
            ))
        })?;
        let client_email = key.client_email.clone();

        let auth = ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|e| EtlError::Config(format!("cannot build authenticator: {}", e)))?;

        info!(client_email = %client_email, "Using service account credentials");
        Ok(Self { auth })
    }
}

#[async_trait]
impl AccessTokenProvider for ServiceAccountTokens {
    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(&[BIGQUERY_SCOPE])
            .await
            .map_err(|e| EtlError::Connection {
                system: System::Sink,
                message: format!("token refresh failed: {}", e),
            })?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| EtlError::Connection {
                system: System::Sink,
                message: "token response carried no access token".to_string(),
            })
    }
}
