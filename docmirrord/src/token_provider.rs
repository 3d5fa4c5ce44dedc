use docmirror_core::{OAuthClient, OAuthToken};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SyncConfig;

const DEFAULT_SCOPE: &str = "data:read";

#[derive(Debug, Error)]
pub enum TokenProviderError {
    #[error("oauth client is required to obtain a new token")]
    MissingOAuthClient,
    #[error("access token expired and no refresh token is available")]
    MissingRefreshToken,
    #[error("no access token, refresh token or client credentials configured")]
    MissingAccessToken,
    #[error("oauth request failed: {0}")]
    OAuth(#[from] docmirror_core::OAuthError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the token does not expire.
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
}

impl TokenState {
    fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: Some(token.access_token.clone()),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64)),
            scope: token.scope.clone(),
        }
    }
}

/// Hands out a bearer token that is valid for at least `refresh_skew_secs`, refreshing it
/// through the OAuth client when needed. Shared by every run of the engine.
pub struct TokenProvider {
    state: Mutex<TokenState>,
    oauth_client: Option<OAuthClient>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: TokenState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state: Mutex::new(state),
            oauth_client,
            refresh_skew_secs: 60,
        }
    }

    /// Token material from `DOCMIRROR_ACCESS_TOKEN`, `DOCMIRROR_REFRESH_TOKEN`,
    /// `DOCMIRROR_TOKEN_EXPIRES_AT` and `DOCMIRROR_TOKEN_SCOPE`. The OAuth client is built only
    /// when both `DOCMIRROR_CLIENT_ID` and `DOCMIRROR_CLIENT_SECRET` are set.
    pub fn from_env(config: &SyncConfig) -> Result<Self, TokenProviderError> {
        let state = TokenState {
            access_token: env_value("DOCMIRROR_ACCESS_TOKEN"),
            refresh_token: env_value("DOCMIRROR_REFRESH_TOKEN"),
            expires_at: env_value("DOCMIRROR_TOKEN_EXPIRES_AT").and_then(|v| v.parse().ok()),
            scope: env_value("DOCMIRROR_TOKEN_SCOPE"),
        };
        let oauth_client = match (
            env_value("DOCMIRROR_CLIENT_ID"),
            env_value("DOCMIRROR_CLIENT_SECRET"),
        ) {
            (Some(id), Some(secret)) => Some(OAuthClient::with_base_url(
                &config.api_base_url,
                id,
                secret,
            )?),
            _ => None,
        };
        Ok(Self::new(state, oauth_client))
    }

    pub async fn valid_access_token(&self) -> Result<String, TokenProviderError> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.access_token.as_ref() {
            if !self.should_refresh(&state) {
                return Ok(token.clone());
            }
        }
        let refreshed = self.obtain(&state).await?;
        let token = refreshed
            .access_token
            .clone()
            .ok_or(TokenProviderError::MissingAccessToken)?;
        *state = refreshed;
        Ok(token)
    }

    fn should_refresh(&self, state: &TokenState) -> bool {
        let Some(expires_at) = state.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(self.refresh_skew_secs)
    }

    async fn obtain(&self, current: &TokenState) -> Result<TokenState, TokenProviderError> {
        match (current.refresh_token.as_deref(), self.oauth_client.as_ref()) {
            (Some(refresh_token), Some(client)) => {
                debug!("refreshing access token");
                let token = client
                    .refresh_token(refresh_token, current.scope.as_deref())
                    .await?;
                let mut refreshed = TokenState::from_oauth_token(&token);
                if refreshed.refresh_token.is_none() {
                    refreshed.refresh_token = Some(refresh_token.to_string());
                }
                if refreshed.scope.is_none() {
                    refreshed.scope = current.scope.clone();
                }
                info!(expires_at = ?refreshed.expires_at, "access token refreshed");
                Ok(refreshed)
            }
            (Some(_), None) => Err(TokenProviderError::MissingOAuthClient),
            (None, Some(client)) => {
                let scope = current.scope.as_deref().unwrap_or(DEFAULT_SCOPE);
                debug!(scope, "requesting client-credentials token");
                let token = client.client_credentials(scope).await?;
                let mut obtained = TokenState::from_oauth_token(&token);
                if obtained.scope.is_none() {
                    obtained.scope = Some(scope.to_string());
                }
                Ok(obtained)
            }
            (None, None) if current.access_token.is_some() => {
                Err(TokenProviderError::MissingRefreshToken)
            }
            (None, None) => Err(TokenProviderError::MissingAccessToken),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
