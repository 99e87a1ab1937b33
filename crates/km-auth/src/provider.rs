//! Token acquisition against the backend auth endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::token::AuthToken;
use crate::AuthError;

/// Issues and refreshes tokens. Implemented over HTTP in production and as
/// scripted fakes in tests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh token for `scope` using the api-key grant.
    async fn get_token(&self, scope: &str) -> Result<AuthToken, AuthError>;

    /// Exchange a refresh token for a new token.
    async fn refresh_token(&self, refresh_token: &str, scope: &str)
        -> Result<AuthToken, AuthError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<Vec<&'a str>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<Vec<String>>,
}

impl TokenResponse {
    fn into_token(self) -> AuthToken {
        let mut token = AuthToken::new(
            self.access_token,
            self.token_type,
            Duration::from_secs(self.expires_in),
        );
        if let Some(refresh) = self.refresh_token {
            token = token.with_refresh_token(refresh);
        }
        if let Some(scope) = self.scope {
            token = token.with_scope(scope);
        }
        token
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct ApiTokenProvider {
    client: reqwest::Client,
    token_url: String,
    api_key: String,
}

impl ApiTokenProvider {
    pub fn new(api_endpoint: &url::Url, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let token_url = format!("{}api/auth/token", ensure_trailing_slash(api_endpoint));
        Self {
            client,
            token_url,
            api_key: api_key.into(),
        }
    }

    async fn request(&self, body: TokenRequest<'_>) -> Result<AuthToken, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(format!("malformed token response: {e}")))?;
        Ok(parsed.into_token())
    }
}

fn ensure_trailing_slash(url: &url::Url) -> String {
    let s = url.as_str();
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

#[async_trait]
impl TokenProvider for ApiTokenProvider {
    async fn get_token(&self, scope: &str) -> Result<AuthToken, AuthError> {
        self.request(TokenRequest {
            grant_type: "api_key",
            api_key: Some(&self.api_key),
            refresh_token: None,
            scope: Some(vec![scope]),
        })
        .await
    }

    async fn refresh_token(
        &self,
        refresh_token: &str,
        scope: &str,
    ) -> Result<AuthToken, AuthError> {
        self.request(TokenRequest {
            grant_type: "refresh_token",
            api_key: None,
            refresh_token: Some(refresh_token),
            scope: Some(vec![scope]),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_conversion_carries_optionals() {
        let response = TokenResponse {
            access_token: "at".into(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            refresh_token: Some("rt".into()),
            scope: Some(vec!["default".into()]),
        };
        let token = response.into_token();
        assert_eq!(token.access_token, "at");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));
        assert_eq!(token.scope.as_deref(), Some(&["default".to_string()][..]));
        assert!(!token.is_expired());
    }

    #[test]
    fn token_url_joins_cleanly() {
        let url = url::Url::parse("https://api.kilometers.ai").unwrap();
        let provider = ApiTokenProvider::new(&url, "key");
        assert_eq!(provider.token_url, "https://api.kilometers.ai/api/auth/token");

        let url = url::Url::parse("https://api.kilometers.ai/base/").unwrap();
        let provider = ApiTokenProvider::new(&url, "key");
        assert_eq!(
            provider.token_url,
            "https://api.kilometers.ai/base/api/auth/token"
        );
    }
}
