//! Credential acquisition for external API calls.
//!
//! The pipeline never owns long-lived secrets: it asks a provider for a
//! scoped credential before each external call batch and drops it at run
//! end. The production provider is a secret-manager client; deployments and
//! tests use the environment-backed provider below.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::error::PipelineError;

/// A short-lived secret value. Intentionally opaque in `Debug` output so a
/// credential can never leak through logs or error context.
#[derive(Clone)]
pub struct ScopedCredential {
    value: String,
    pub expires_at: DateTime<Utc>,
}

impl ScopedCredential {
    pub fn new(value: String, expires_at: DateTime<Utc>) -> Self {
        Self { value, expires_at }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for ScopedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedCredential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Boundary to the secret store. Implementations must return a fresh,
/// scoped credential on every call; callers must not cache across runs.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_secret(&self, secret_id: &str) -> Result<ScopedCredential, PipelineError>;
}

/// Resolves secrets from the process environment (dotenv-friendly). Stands
/// in for the secret-manager client in local deployments and tests.
pub struct EnvCredentialProvider {
    /// Validity window stamped onto returned credentials.
    ttl: Duration,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self {
            ttl: Duration::minutes(30),
        }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn access_secret(&self, secret_id: &str) -> Result<ScopedCredential, PipelineError> {
        let value = std::env::var(secret_id)
            .map_err(|_| PipelineError::Credential(format!("secret '{}' not set", secret_id)))?;
        Ok(ScopedCredential::new(value, Utc::now() + self.ttl))
    }
}

/// Header set for the time-entry source API: bearer token plus account id,
/// both resolved through the provider per call batch.
pub async fn source_headers(
    provider: &dyn CredentialProvider,
) -> Result<HeaderMap, PipelineError> {
    let token = provider.access_secret("SOURCE_ACCESS_TOKEN").await?;
    let account_id = provider.access_secret("SOURCE_ACCOUNT_ID").await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token.expose()))
            .map_err(|e| PipelineError::Credential(format!("invalid token bytes: {}", e)))?,
    );
    headers.insert(
        "X-Account-Id",
        HeaderValue::from_str(account_id.expose())
            .map_err(|e| PipelineError::Credential(format!("invalid account id bytes: {}", e)))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_secret() {
        let cred = ScopedCredential::new("hunter2".to_string(), Utc::now());
        let printed = format!("{:?}", cred);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[tokio::test]
    async fn env_provider_resolves_and_stamps_expiry() {
        std::env::set_var("TEST_PIPELINE_SECRET", "abc123");
        let provider = EnvCredentialProvider::new();
        let cred = provider.access_secret("TEST_PIPELINE_SECRET").await.unwrap();
        assert_eq!(cred.expose(), "abc123");
        assert!(!cred.is_expired(Utc::now()));
        std::env::remove_var("TEST_PIPELINE_SECRET");
    }

    #[tokio::test]
    async fn missing_secret_is_a_credential_error() {
        let provider = EnvCredentialProvider::new();
        let err = provider
            .access_secret("DEFINITELY_NOT_SET_ANYWHERE")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Credential(_)));
    }
}
