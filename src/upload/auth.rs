//! Access tokens for the upload API.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AuthError;

/// Tokens closer than this to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Bearer token for the upload API.
#[derive(Clone)]
pub struct Credential {
    pub access_token: String,
    /// `None` means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - ChronoDuration::seconds(EXPIRY_MARGIN_SECS) > now,
            None => true,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of credentials for each upload.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<Credential, AuthError>;
}

/// OAuth client secret plus whatever tokens were cached alongside it.
#[derive(Debug, Clone, Deserialize)]
struct ClientSecrets {
    client_id: String,
    client_secret: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
    refresh_token: Option<String>,
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Accepts the `{"installed": {...}}` / `{"web": {...}}` files issued by the
/// provider's console as well as a flat object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecretsFile {
    Installed { installed: ClientSecrets },
    Web { web: ClientSecrets },
    Flat(ClientSecrets),
}

impl SecretsFile {
    fn into_secrets(self) -> ClientSecrets {
        match self {
            Self::Installed { installed } => installed,
            Self::Web { web } => web,
            Self::Flat(secrets) => secrets,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

struct Loaded {
    secrets: ClientSecrets,
    cached: Option<Credential>,
}

/// Credentials read from a client-secrets file on first use and cached in memory.
///
/// The file is read once. The cached access token is reused until it is about
/// to expire, then refreshed with the stored refresh token.
pub struct FileCredentialProvider {
    path: PathBuf,
    http: reqwest::Client,
    state: Mutex<Option<Loaded>>,
}

impl FileCredentialProvider {
    pub fn new(path: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self {
            path: path.into(),
            http,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Loaded, AuthError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            AuthError::InvalidCredential(format!("cannot read {}: {err}", self.path.display()))
        })?;
        let secrets = serde_json::from_str::<SecretsFile>(&contents)
            .map_err(|err| {
                AuthError::InvalidCredential(format!("cannot parse {}: {err}", self.path.display()))
            })?
            .into_secrets();

        let cached = secrets.access_token.clone().map(|access_token| Credential {
            access_token,
            expires_at: secrets.expires_at,
        });
        debug!(path = %self.path.display(), has_token = cached.is_some(), "loaded client secrets");
        Ok(Loaded { secrets, cached })
    }

    async fn refresh(&self, secrets: &ClientSecrets) -> Result<Credential, AuthError> {
        let Some(refresh_token) = secrets.refresh_token.as_deref() else {
            return Err(AuthError::InvalidCredential(
                "access token missing or expired and no refresh_token is stored".to_string(),
            ));
        };

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&secrets.token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|err| AuthError::TokenEndpoint(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(token_error(status.as_u16(), &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::TokenEndpoint(err.to_string()))?;
        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));

        info!(expires_at = ?expires_at, "refreshed upload access token");
        Ok(Credential {
            access_token: token.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn credential(&self) -> Result<Credential, AuthError> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(self.load().await?);
        }
        let Some(loaded) = state.as_mut() else {
            return Err(AuthError::InvalidCredential("credentials not loaded".to_string()));
        };

        if let Some(cached) = &loaded.cached {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.clone());
            }
        }

        let fresh = self.refresh(&loaded.secrets).await?;
        loaded.cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Map an OAuth error body onto the auth taxonomy.
fn token_error(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(err) if err.error == "access_denied" => AuthError::UserCancelled,
        Ok(err) => AuthError::InvalidCredential(match err.error_description {
            Some(description) => format!("{}: {description}", err.error),
            None => err.error,
        }),
        Err(_) if status >= 500 => AuthError::TokenEndpoint(format!("HTTP {status}")),
        Err(_) => AuthError::InvalidCredential(format!("HTTP {status}: {body}")),
    }
}
