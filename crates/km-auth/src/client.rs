//! HTTP client wrapper that signs requests with a bearer token and retries
//! once after a forced refresh on 401.

use reqwest::header::AUTHORIZATION;
use reqwest::{Request, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::refresh::TokenSource;
use crate::AuthError;

pub struct AuthedClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    scope: String,
}

impl AuthedClient {
    pub fn new(tokens: Arc<dyn TokenSource>, scope: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            tokens,
            scope: scope.into(),
        }
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }

    /// Execute with an `Authorization` header attached.
    ///
    /// On 401 the token is force-refreshed once and the request replayed;
    /// the second response is returned regardless of its status.
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        // Streaming bodies cannot be cloned; those requests simply skip the
        // 401 replay.
        let replay = request.try_clone();

        let token = self.tokens.get_valid_token(&self.scope).await?;
        let response = self.send_signed(request, &token.header_value()).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(replay) = replay else {
            return Ok(response);
        };

        tracing::debug!(scope = %self.scope, "401 from collector, forcing token refresh");
        let token = self.tokens.force_refresh(&self.scope).await?;
        self.send_signed(replay, &token.header_value()).await
    }

    async fn send_signed(&self, mut request: Request, header: &str) -> Result<Response, AuthError> {
        let value = header
            .parse()
            .map_err(|_| AuthError::Protocol("token not representable as a header".into()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
        self.client
            .execute(request)
            .await
            .map_err(|e| AuthError::Network(e.to_string()))
    }
}
