//! OAuth2 token handling for cloud providers
//!
//! The interactive half of the authorization flow (browser redirect, PKCE
//! callback) lives outside this crate; an external collaborator deposits the
//! resulting tokens in the injected [`CredentialStore`]. This module owns
//! everything after that point: persistence, expiry tracking, and the
//! non-interactive refresh-token exchange adapters use to keep a valid
//! access token.

use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, TokenResponse, TokenUrl,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::credentials::CredentialStore;
use super::types::{ProviderId, StorageError};

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OAuth2 endpoints and credentials for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: ProviderId,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
}

impl OAuthConfig {
    /// Google Drive OAuth config
    pub fn google(client_id: &str, client_secret: Option<&str>, scopes: &[String]) -> Self {
        let scopes = if scopes.is_empty() {
            vec![
                "https://www.googleapis.com/auth/drive.file".to_string(),
                "https://www.googleapis.com/auth/drive.metadata.readonly".to_string(),
            ]
        } else {
            scopes.to_vec()
        };
        Self {
            provider: ProviderId::Google,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes,
            redirect_uri: "http://localhost:8000/callback".to_string(),
        }
    }

    /// Dropbox OAuth config
    pub fn dropbox(app_key: &str, app_secret: Option<&str>, redirect_uri: Option<&str>) -> Self {
        Self {
            provider: ProviderId::Dropbox,
            client_id: app_key.to_string(),
            client_secret: app_secret.map(str::to_string),
            auth_url: "https://www.dropbox.com/oauth2/authorize".to_string(),
            token_url: "https://api.dropboxapi.com/oauth2/token".to_string(),
            scopes: vec![
                "account_info.read".to_string(),
                "files.metadata.read".to_string(),
                "files.content.read".to_string(),
                "files.content.write".to_string(),
            ],
            redirect_uri: redirect_uri
                .unwrap_or("http://localhost:8000/callback")
                .to_string(),
        }
    }

    /// OneDrive (Microsoft Graph) OAuth config
    pub fn onedrive(client_id: &str, client_secret: Option<&str>, redirect_uri: Option<&str>) -> Self {
        Self {
            provider: ProviderId::OneDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.map(str::to_string),
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            scopes: vec![
                "Files.ReadWrite".to_string(),
                "offline_access".to_string(),
            ],
            redirect_uri: redirect_uri
                .unwrap_or("http://localhost:8000/callback")
                .to_string(),
        }
    }
}

/// Stored OAuth2 tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp; `None` means no known expiry
    pub expires_at: Option<i64>,
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl StoredTokens {
    /// Check if the access token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + 300,
            None => false,
        }
    }
}

/// Token persistence and refresh, backed by the injected credential store.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    fn key(provider: ProviderId) -> String {
        format!("oauth_{}", provider)
    }

    /// Load stored tokens; absent tokens are the normal unauthenticated state.
    pub fn load_tokens(&self, provider: ProviderId) -> Option<StoredTokens> {
        let json = self.store.get(&Self::key(provider))?;
        match serde_json::from_str(&json) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                tracing::warn!("discarding unreadable stored tokens for {}: {}", provider, e);
                None
            }
        }
    }

    pub fn store_tokens(
        &self,
        provider: ProviderId,
        tokens: &StoredTokens,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(tokens)
            .map_err(|e| StorageError::ParseError(format!("serialize tokens: {}", e)))?;
        self.store.set(&Self::key(provider), &json)?;
        info!("tokens stored for {}", provider);
        Ok(())
    }

    pub fn delete_tokens(&self, provider: ProviderId) -> Result<(), StorageError> {
        self.store.remove(&Self::key(provider))?;
        info!("tokens deleted for {}", provider);
        Ok(())
    }

    pub fn has_tokens(&self, provider: ProviderId) -> bool {
        self.load_tokens(provider).is_some()
    }

    /// Get a valid access token, refreshing through the provider's token
    /// endpoint when the stored one is expired.
    pub async fn get_valid_token(&self, config: &OAuthConfig) -> Result<SecretString, StorageError> {
        let mut tokens = self.load_tokens(config.provider).ok_or_else(|| {
            StorageError::AuthenticationFailed(format!(
                "{}: no stored credential - run the authorization flow first",
                config.provider.label()
            ))
        })?;

        if tokens.is_expired() {
            let refresh = tokens.refresh_token.clone().ok_or_else(|| {
                StorageError::AuthenticationFailed(
                    "token expired and no refresh token available".to_string(),
                )
            })?;
            tokens = self.refresh_tokens(config, &refresh).await?;
        }

        Ok(SecretString::from(tokens.access_token))
    }

    /// Exchange a refresh token for a fresh access token and persist it.
    async fn refresh_tokens(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<StoredTokens, StorageError> {
        let client = create_client(config)?;

        // Redirects disabled per oauth2 crate guidance for token endpoints
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StorageError::RemoteCallFailed(e.to_string()))?;

        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http)
            .await
            .map_err(|e| {
                StorageError::AuthenticationFailed(format!("token refresh failed: {}", e))
            })?;

        let expires_at = token_result
            .expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        let tokens = StoredTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result
                .refresh_token()
                .map(|t| t.secret().clone())
                // Keep old refresh token if the provider does not rotate it
                .or_else(|| Some(refresh_token.to_string())),
            expires_at,
            token_type: "Bearer".to_string(),
            scopes: config.scopes.clone(),
        };

        self.store_tokens(config.provider, &tokens)?;
        info!("tokens refreshed for {}", config.provider);

        Ok(tokens)
    }
}

/// Create an OAuth2 client from config (v5 builder API)
fn create_client(config: &OAuthConfig) -> Result<ConfiguredClient, StorageError> {
    let auth_url = AuthUrl::new(config.auth_url.clone())
        .map_err(|e| StorageError::ParseError(format!("invalid auth URL: {}", e)))?;
    let token_url = TokenUrl::new(config.token_url.clone())
        .map_err(|e| StorageError::ParseError(format!("invalid token URL: {}", e)))?;
    let redirect_url = RedirectUrl::new(config.redirect_uri.clone())
        .map_err(|e| StorageError::ParseError(format!("invalid redirect URL: {}", e)))?;

    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect_url);

    if let Some(ref secret) = config.client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.clone()));
    }

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;

    fn tokens(expires_at: Option<i64>) -> StoredTokens {
        StoredTokens {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at,
            token_type: "Bearer".to_string(),
            scopes: vec![],
        }
    }

    #[test]
    fn expiry_uses_buffer() {
        let now = chrono::Utc::now().timestamp();
        assert!(tokens(Some(now - 10)).is_expired());
        assert!(tokens(Some(now + 60)).is_expired()); // inside 5 min buffer
        assert!(!tokens(Some(now + 3600)).is_expired());
        assert!(!tokens(None).is_expired());
    }

    #[test]
    fn token_round_trip_through_store() {
        let manager = TokenManager::new(Arc::new(MemoryCredentialStore::new()));
        assert!(!manager.has_tokens(ProviderId::Google));

        manager
            .store_tokens(ProviderId::Google, &tokens(None))
            .unwrap();
        let loaded = manager.load_tokens(ProviderId::Google).unwrap();
        assert_eq!(loaded.access_token, "at");
        assert_eq!(loaded.refresh_token.as_deref(), Some("rt"));

        manager.delete_tokens(ProviderId::Google).unwrap();
        assert!(!manager.has_tokens(ProviderId::Google));
    }

    #[tokio::test]
    async fn valid_token_requires_stored_credential() {
        let manager = TokenManager::new(Arc::new(MemoryCredentialStore::new()));
        let config = OAuthConfig::google("cid", Some("secret"), &[]);
        let err = manager.get_valid_token(&config).await.unwrap_err();
        assert!(matches!(err, StorageError::AuthenticationFailed(_)));
    }
}
