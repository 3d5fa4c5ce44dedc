use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://developer.api.autodesk.com";
const TOKEN_PATH: &str = "/authentication/v2/token";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("token endpoint returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Token endpoint client. Credentials go in the basic auth header.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    base_url: Url,
    client_id: String,
    client_secret: String,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Self::with_base_url(DEFAULT_BASE_URL, client_id, client_secret)
    }

    pub fn with_base_url(
        base_url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<OAuthToken, OAuthError> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }
        self.request_token(&form).await
    }

    /// Two-legged token for server-to-server access.
    pub async fn client_credentials(&self, scope: &str) -> Result<OAuthToken, OAuthError> {
        self.request_token(&[("grant_type", "client_credentials"), ("scope", scope)])
            .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<OAuthToken, OAuthError> {
        let url = self.base_url.join(TOKEN_PATH)?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response.json::<OAuthToken>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OAuthError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}
