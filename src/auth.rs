//! Bearer-token collaborators for provider API calls
//!
//! The engine never refreshes credentials itself: every request asks a
//! [`TokenProvider`] for a currently-valid token. The OAuth2 implementation
//! delegates caching and refresh to `yup-oauth2`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::info;
use yup_oauth2::authenticator::DefaultAuthenticator;
use yup_oauth2::ApplicationSecret;

use crate::config::ProviderKind;
use crate::error::{Result, SyncError};

/// Gmail scopes: read/modify/trash/send (no permanent deletion)
pub const GMAIL_SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

/// Microsoft Graph delegated scopes for mailbox read/write and send
pub const GRAPH_SCOPES: &[&str] = &[
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.Send",
    "offline_access",
];

pub fn scopes_for(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::Gmail => GMAIL_SCOPES,
        ProviderKind::Graph => GRAPH_SCOPES,
    }
}

/// Supplies a currently-valid bearer credential per call
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, e.g. from an environment variable or a test
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read `SENDER_SWEEP_ACCESS_TOKEN`, if set
    pub fn from_env() -> Option<Self> {
        env::var("SENDER_SWEEP_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// OAuth2 installed-application flow with on-disk token cache
pub struct OAuthTokenProvider {
    auth: DefaultAuthenticator,
    scopes: &'static [&'static str],
}

impl OAuthTokenProvider {
    /// Build the authenticator and pre-authorize the provider's scopes
    ///
    /// HTTPRedirect opens a browser for user authorization on first use;
    /// afterwards the cached refresh token is used.
    pub async fn initialize(
        kind: ProviderKind,
        credentials_path: &Path,
        token_cache_path: &Path,
    ) -> Result<Self> {
        let creds = load_credentials(credentials_path)
            .await
            .map_err(|e| SyncError::AuthError(format!("Failed to read credentials: {}", e)))?;
        info!("Using OAuth client {}", creds.installed.client_id);

        Self::with_secret(kind, creds.into_secret(), token_cache_path).await
    }

    pub async fn with_secret(
        kind: ProviderKind,
        secret: ApplicationSecret,
        token_cache_path: &Path,
    ) -> Result<Self> {
        let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
            secret,
            yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
        )
        .persist_tokens_to_disk(token_cache_path)
        .build()
        .await
        .map_err(|e| SyncError::AuthError(format!("Failed to build authenticator: {}", e)))?;

        let provider = Self {
            auth,
            scopes: scopes_for(kind),
        };

        // Obtain a token up front so concurrent requests find it cached
        provider.access_token().await?;

        Ok(provider)
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(self.scopes)
            .await
            .map_err(|e| SyncError::AuthError(format!("Failed to obtain token: {}", e)))?;

        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| SyncError::AuthError("Token response had no access token".to_string()))
    }
}

/// Credential structure matching the OAuth2 "installed" credentials JSON format
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub installed: InstalledApp,
}

impl Credentials {
    pub fn into_secret(self) -> ApplicationSecret {
        let app = self.installed;
        ApplicationSecret {
            client_id: app.client_id,
            client_secret: app.client_secret.unwrap_or_default(),
            auth_uri: app.auth_uri,
            token_uri: app.token_uri,
            redirect_uris: app.redirect_uris,
            project_id: app.project_id,
            ..Default::default()
        }
    }
}

/// Installed application credentials (desktop/CLI app)
#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
}

/// Load OAuth2 credentials from a JSON file
pub async fn load_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await?;
    let creds = serde_json::from_str(&content)?;
    Ok(creds)
}

/// Build an application secret from environment variables
///
/// - `SENDER_SWEEP_CLIENT_ID`: OAuth2 client ID
/// - `SENDER_SWEEP_CLIENT_SECRET`: OAuth2 client secret (optional for public Graph clients)
/// - `SENDER_SWEEP_REDIRECT_URI`: Redirect URI (defaults to http://localhost:8080)
pub fn load_credentials_from_env(kind: ProviderKind) -> Result<ApplicationSecret> {
    let client_id = env::var("SENDER_SWEEP_CLIENT_ID")
        .map_err(|_| SyncError::ConfigError("SENDER_SWEEP_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("SENDER_SWEEP_CLIENT_SECRET").unwrap_or_default();
    let redirect_uri = env::var("SENDER_SWEEP_REDIRECT_URI")
        .unwrap_or_else(|_| "http://localhost:8080".to_string());

    let (auth_uri, token_uri) = match kind {
        ProviderKind::Gmail => (
            "https://accounts.google.com/o/oauth2/auth",
            "https://oauth2.googleapis.com/token",
        ),
        ProviderKind::Graph => (
            "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        ),
    };

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: auth_uri.to_string(),
        token_uri: token_uri.to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Restrict the token cache to the owner (0600)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
