//! Azure token acquisition.
//!
//! The ARM and Log Analytics backends authenticate with OAuth2 bearer
//! tokens. [`TokenProvider`] abstracts where those tokens come from;
//! [`DefaultCredential`] picks the client-secret flow when a service
//! principal is configured in the environment and falls back to the
//! instance's managed identity otherwise.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::BackendError;

/// Entra ID token endpoint template for the client-credentials flow.
const LOGIN_ENDPOINT: &str = "https://login.microsoftonline.com";

/// Instance metadata service token endpoint (managed identity).
const IMDS_TOKEN_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Tokens are refreshed this long before their reported expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Produces bearer tokens for a given OAuth2 scope.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, scope: &str) -> Result<String, BackendError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// `expires_in` is a number from the login endpoint but a string from IMDS.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn secs(&self) -> Result<u64, BackendError> {
        match self {
            ExpiresIn::Seconds(n) => Ok(*n),
            ExpiresIn::Text(s) => s.parse::<u64>().map_err(|_| {
                BackendError::Credential(format!("unparsable expires_in `{s}`"))
            }),
        }
    }
}

/// Per-scope token cache.
struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

impl TokenCache {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, scope: &str) -> Option<String> {
        let entries = self.entries.lock().expect("token cache poisoned");
        entries
            .get(scope)
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }

    fn put(&self, scope: &str, token: String, lifetime: Duration) {
        let expires_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SLACK);
        let mut entries = self.entries.lock().expect("token cache poisoned");
        entries.insert(scope.to_string(), CachedToken { token, expires_at });
    }
}

/// Client-credentials flow against the Entra ID token endpoint.
pub struct ClientSecretCredential {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    client: reqwest::Client,
    cache: TokenCache,
}

impl ClientSecretCredential {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client: reqwest::Client::new(),
            cache: TokenCache::new(),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientSecretCredential {
    async fn token(&self, scope: &str) -> Result<String, BackendError> {
        if let Some(token) = self.cache.get(scope) {
            return Ok(token);
        }

        let url = format!("{LOGIN_ENDPOINT}/{}/oauth2/v2.0/token", self.tenant_id);

        debug!(scope, "requesting token via client credentials");

        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Credential(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Credential(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.secs()?);
        self.cache.put(scope, token.access_token.clone(), lifetime);
        Ok(token.access_token)
    }
}

/// Managed identity via the instance metadata service.
pub struct ManagedIdentityCredential {
    client: reqwest::Client,
    cache: TokenCache,
}

impl ManagedIdentityCredential {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            cache: TokenCache::new(),
        }
    }
}

impl Default for ManagedIdentityCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for ManagedIdentityCredential {
    async fn token(&self, scope: &str) -> Result<String, BackendError> {
        if let Some(token) = self.cache.get(scope) {
            return Ok(token);
        }

        debug!(scope, "requesting token via managed identity");

        let resp = self
            .client
            .get(IMDS_TOKEN_ENDPOINT)
            .header("Metadata", "true")
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", resource_for_scope(scope)),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Credential(format!(
                "instance metadata service returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::Credential(format!("token response: {e}")))?;

        let lifetime = Duration::from_secs(token.expires_in.secs()?);
        self.cache.put(scope, token.access_token.clone(), lifetime);
        Ok(token.access_token)
    }
}

/// IMDS takes a bare resource URI where the v2 endpoints take a scope.
fn resource_for_scope(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

/// Credential chain matching the service's two deployment shapes: a
/// service principal configured through the environment, else the
/// instance's managed identity.
pub enum DefaultCredential {
    ClientSecret(ClientSecretCredential),
    ManagedIdentity(ManagedIdentityCredential),
}

impl DefaultCredential {
    /// Build from `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` /
    /// `AZURE_CLIENT_SECRET` when all three are present, otherwise fall
    /// back to managed identity.
    pub fn from_env() -> Self {
        let tenant = std::env::var("AZURE_TENANT_ID").ok();
        let client = std::env::var("AZURE_CLIENT_ID").ok();
        let secret = std::env::var("AZURE_CLIENT_SECRET").ok();

        match (tenant, client, secret) {
            (Some(tenant), Some(client), Some(secret)) => {
                debug!("using client-secret credential from environment");
                Self::ClientSecret(ClientSecretCredential::new(tenant, client, secret))
            }
            _ => {
                debug!("using managed identity credential");
                Self::ManagedIdentity(ManagedIdentityCredential::new())
            }
        }
    }
}

#[async_trait]
impl TokenProvider for DefaultCredential {
    async fn token(&self, scope: &str) -> Result<String, BackendError> {
        match self {
            Self::ClientSecret(cred) => cred.token(scope).await,
            Self::ManagedIdentity(cred) => cred.token(scope).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_returns_unexpired_token() {
        let cache = TokenCache::new();
        cache.put("scope-a", "tok".to_string(), Duration::from_secs(3600));
        assert_eq!(cache.get("scope-a").as_deref(), Some("tok"));
        assert_eq!(cache.get("scope-b"), None);
    }

    #[test]
    fn cache_expires_within_slack() {
        let cache = TokenCache::new();
        // Lifetime shorter than the slack: effectively already expired.
        cache.put("scope", "tok".to_string(), Duration::from_secs(30));
        assert_eq!(cache.get("scope"), None);
    }

    #[test]
    fn cache_replaces_token_per_scope() {
        let cache = TokenCache::new();
        cache.put("scope", "old".to_string(), Duration::from_secs(3600));
        cache.put("scope", "new".to_string(), Duration::from_secs(3600));
        assert_eq!(cache.get("scope").as_deref(), Some("new"));
    }

    #[test]
    fn expires_in_accepts_number_and_string() {
        let numeric: TokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":3599}"#).unwrap();
        assert_eq!(numeric.expires_in.secs().unwrap(), 3599);

        let text: TokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":"3599"}"#).unwrap();
        assert_eq!(text.expires_in.secs().unwrap(), 3599);

        let bad: TokenResponse =
            serde_json::from_str(r#"{"access_token":"t","expires_in":"soon"}"#).unwrap();
        assert!(bad.expires_in.secs().is_err());
    }

    #[test]
    fn scope_to_resource_strips_default_suffix() {
        assert_eq!(
            resource_for_scope("https://management.azure.com/.default"),
            "https://management.azure.com"
        );
        assert_eq!(
            resource_for_scope("https://management.azure.com"),
            "https://management.azure.com"
        );
    }
}
