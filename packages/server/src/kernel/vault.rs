//! Credential vault boundary.
//!
//! Store credentials are sealed blobs; sealing and unsealing belong to an
//! external key service behind this trait. The orchestration plane only ever
//! sees the unsealed shape long enough to build a request, and never logs it.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domains::stores::SealedCredentials;

/// Unsealed credential shape for one store connection.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreCredentials {
    pub access_token: Option<String>,
    pub webhook_secret: Option<String>,
    /// Store-specific API base (e.g. the myshopify.com admin URL).
    pub api_base_url: Option<String>,
}

#[async_trait::async_trait]
pub trait CredentialVault: Send + Sync {
    async fn unseal(&self, sealed: &SealedCredentials) -> Result<StoreCredentials>;
}

/// Vault for development and tests: the blob is the plaintext JSON shape.
/// Production deployments replace this with the key-service client.
pub struct StaticVault;

#[async_trait::async_trait]
impl CredentialVault for StaticVault {
    async fn unseal(&self, sealed: &SealedCredentials) -> Result<StoreCredentials> {
        serde_json::from_value(sealed.expose().clone())
            .context("credential blob has an unexpected shape")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_vault_unseals_plain_json() {
        let sealed = SealedCredentials::new(serde_json::json!({
            "access_token": "tok",
            "webhook_secret": "sec",
        }));
        let creds = StaticVault.unseal(&sealed).await.unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("tok"));
        assert_eq!(creds.webhook_secret.as_deref(), Some("sec"));
        assert!(creds.api_base_url.is_none());
    }

    #[tokio::test]
    async fn unknown_fields_are_ignored() {
        let sealed = SealedCredentials::new(serde_json::json!({
            "access_token": "tok",
            "rotation_epoch": 3,
        }));
        assert!(StaticVault.unseal(&sealed).await.is_ok());
    }
}
